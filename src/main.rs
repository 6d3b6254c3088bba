use anyhow::Result;
use kgen::core::config::Config;
use kgen::core::io::{NativeStorage, Storage};
use kgen::services::comfyui::ComfyUiClient;
use kgen::services::llm::create_llm;
use kgen::services::setup::{ask_prompt, run_setup};
use kgen::services::video::create_video_client;
use kgen::services::workflow::Pipeline;
use std::sync::Arc;

const CONFIG_PATH: &str = "config.yml";

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let mut config = match Config::load(CONFIG_PATH) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            eprintln!("Please ensure '{}' exists with valid LLM settings.", CONFIG_PATH);
            return Err(e);
        }
    };
    config.ensure_directories()?;

    let storage: Arc<dyn Storage> = Arc::new(NativeStorage::new());
    if run_setup(&mut config, storage.as_ref()).await? {
        config.save(CONFIG_PATH)?;
    }

    // Missing keys fail here, before any generation starts.
    let llm = create_llm(&config)?;
    let video = if config.generation.video {
        Some(create_video_client(&config.video)?)
    } else {
        None
    };
    let images = Arc::new(ComfyUiClient::from_config(&config.comfyui, storage.as_ref()).await?);

    let args: Vec<String> = std::env::args().skip(1).collect();
    let prompt = if args.is_empty() {
        ask_prompt(config.generation.mode)?
    } else {
        args.join(" ")
    };

    let pipeline = Pipeline::new(config, llm, images, video, storage);
    let state = pipeline.run(&prompt).await?;

    println!("Output: {}", state.output_dir);
    println!("Images: {}", state.image_paths.len());
    if let Some(summary) = &state.video_summary {
        println!(
            "Videos: {}/{} succeeded ({} attempts)",
            summary.successful,
            summary.total,
            summary.total_attempts()
        );
    }
    if let Some(video) = &state.combined_video {
        println!("Combined video: {}", video);
    }
    if let Some(record) = &state.record_path {
        println!("Record: {}", record);
    }
    Ok(())
}
