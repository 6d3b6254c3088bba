use anyhow::{anyhow, Result};
use inquire::{MultiSelect, Text};
use log::warn;

use crate::core::config::{Config, LoraConfig, LoraMode, Mode};
use crate::core::io::Storage;
use crate::services::lora::LoraCatalog;

/// Group mode with nothing pinned asks which adapters are always applied.
pub fn needs_lora_setup(config: &LoraConfig) -> bool {
    config.mode == LoraMode::Group && config.required.is_empty() && config.optional.is_empty()
}

/// Interactive first-run choices. Returns true when the config changed and should be saved.
pub async fn run_setup(config: &mut Config, storage: &dyn Storage) -> Result<bool> {
    if !needs_lora_setup(&config.lora) {
        return Ok(false);
    }

    let catalog = match LoraCatalog::load(storage, &config.lora.catalog, &config.lora.model_type).await {
        Ok(c) if !c.is_empty() => c,
        Ok(_) => return Ok(false),
        Err(e) => {
            warn!("Skipping LoRA setup: {}", e);
            return Ok(false);
        }
    };

    let options: Vec<String> = catalog
        .descriptors()
        .map(|d| {
            if d.description.is_empty() {
                d.name.clone()
            } else {
                format!("{} - {}", d.name, d.description)
            }
        })
        .collect();
    let chosen = MultiSelect::new("Select LoRAs applied to every image:", options.clone())
        .prompt()
        .map_err(|e| anyhow!("Selection failed: {}", e))?;

    let names: Vec<String> = catalog.descriptors().map(|d| d.name.clone()).collect();
    config.lora.required = chosen
        .iter()
        .filter_map(|c| options.iter().position(|o| o == c))
        .map(|i| names[i].clone())
        .collect();
    Ok(true)
}

pub fn ask_prompt(mode: Mode) -> Result<String> {
    let message = match mode {
        Mode::Story => "Story prompt:",
        Mode::Poetry => "Chinese poem:",
    };
    let prompt = Text::new(message)
        .prompt()
        .map_err(|e| anyhow!("Input failed: {}", e))?;
    if prompt.trim().is_empty() {
        return Err(anyhow!("A prompt is required"));
    }
    Ok(prompt.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::io::NativeStorage;

    #[test]
    fn test_needs_lora_setup_only_for_empty_group() {
        let mut lora = LoraConfig::default();
        assert!(!needs_lora_setup(&lora));
        lora.mode = LoraMode::Group;
        assert!(needs_lora_setup(&lora));
        lora.optional = vec!["Ink".to_string()];
        assert!(!needs_lora_setup(&lora));
    }

    #[tokio::test]
    async fn test_setup_skips_when_catalog_missing() -> Result<()> {
        let mut config: Config = serde_yaml_ng::from_str(
            "llm:\n  provider: openai\nlora:\n  mode: group\n  catalog: /nonexistent/lora_config.json\n",
        )?;
        let changed = run_setup(&mut config, &NativeStorage::new()).await?;
        assert!(!changed);
        assert!(config.lora.required.is_empty());
        Ok(())
    }
}
