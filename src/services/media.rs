use anyhow::{anyhow, bail, Context, Result};
use log::{info, warn};
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;

pub const COMBINED_VIDEO: &str = "combined_story.mp4";
pub const COMBINED_WITH_AUDIO: &str = "combined_story_with_audio.mp4";

/// Length of one generated clip; xfade offsets are laid out on it.
const CLIP_SECONDS: f64 = 5.0;

const COMPAT_ENCODE: &[&str] = &[
    "-c:v",
    "libx264",
    "-pix_fmt",
    "yuv420p",
    "-profile:v",
    "high",
    "-level",
    "4.0",
    "-crf",
    "23",
    "-preset",
    "medium",
    "-movflags",
    "+faststart",
];

fn args<I, S>(parts: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    parts.into_iter().map(|s| s.as_ref().to_string()).collect()
}

async fn run_ffmpeg(args: &[String]) -> Result<()> {
    let output = Command::new("ffmpeg")
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await
        .context("Failed to spawn ffmpeg")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
        return Err(anyhow!(
            "ffmpeg exited with {}: {}",
            output.status,
            tail.into_iter().rev().collect::<Vec<_>>().join(" | ")
        ));
    }
    Ok(())
}

/// Contents of an ffmpeg concat demuxer list.
pub fn concat_list(inputs: &[String]) -> String {
    inputs
        .iter()
        .map(|p| format!("file '{}'\n", p.replace('\'', "'\\''")))
        .collect()
}

/// Builds a chained xfade filter over `count` inputs. Returns the filter and its final label.
pub fn xfade_filter(count: usize, duration: f64) -> (String, String) {
    let mut filters = Vec::new();
    let mut previous = "0".to_string();
    for i in 1..count {
        let label = format!("v{}", i);
        let offset = i as f64 * (CLIP_SECONDS - duration);
        filters.push(format!(
            "[{}][{}]xfade=transition=fade:duration={}:offset={}[{}]",
            previous, i, duration, offset, label
        ));
        previous = label;
    }
    (filters.join(";"), previous)
}

async fn existing(inputs: &[String]) -> Vec<String> {
    let mut found = Vec::new();
    for p in inputs {
        match tokio::fs::canonicalize(p).await {
            Ok(abs) => found.push(abs.to_string_lossy().to_string()),
            Err(_) => warn!("Skipping missing video {}", p),
        }
    }
    found
}

pub async fn combine_videos(inputs: &[String], output: &str) -> Result<()> {
    let inputs = existing(inputs).await;
    if inputs.is_empty() {
        bail!("No videos to combine");
    }

    if inputs.len() == 1 {
        let mut cmd = args(["-i", inputs[0].as_str()]);
        cmd.extend(args(COMPAT_ENCODE));
        cmd.extend(args(["-y", output]));
        if let Err(e) = run_ffmpeg(&cmd).await {
            warn!("Re-encode of single video failed ({}), copying instead", e);
            tokio::fs::copy(&inputs[0], output)
                .await
                .with_context(|| format!("Failed to copy {} to {}", inputs[0], output))?;
        }
        info!("Single video written to {}", output);
        return Ok(());
    }

    info!("Combining {} videos into {}", inputs.len(), output);
    let list_path = format!("{}.txt", output);
    tokio::fs::write(&list_path, concat_list(&inputs)).await?;

    let mut encode = args(["-f", "concat", "-safe", "0", "-i", list_path.as_str()]);
    encode.extend(args(COMPAT_ENCODE));
    encode.extend(args(["-y", output]));

    let result = match run_ffmpeg(&encode).await {
        Ok(()) => Ok(()),
        Err(e) => {
            warn!("Compatible encoding failed ({}), falling back to stream copy", e);
            let copy = args([
                "-f",
                "concat",
                "-safe",
                "0",
                "-i",
                list_path.as_str(),
                "-c",
                "copy",
                "-y",
                output,
            ]);
            run_ffmpeg(&copy).await
        }
    };
    let _ = tokio::fs::remove_file(&list_path).await;
    result?;

    if let Ok(meta) = tokio::fs::metadata(output).await {
        info!("✅ Combined video: {} ({:.1} MB)", output, meta.len() as f64 / (1024.0 * 1024.0));
    }
    Ok(())
}

pub async fn combine_with_transitions(inputs: &[String], output: &str, duration: f64) -> Result<()> {
    let found = existing(inputs).await;
    if found.len() < 2 {
        return combine_videos(inputs, output).await;
    }

    let (filter, last) = xfade_filter(found.len(), duration);
    let mut cmd = Vec::new();
    for p in &found {
        cmd.extend(args(["-i", p.as_str()]));
    }
    cmd.extend(args(["-filter_complex", filter.as_str()]));
    cmd.extend(args(["-map".to_string(), format!("[{}]", last)]));
    cmd.extend(args(["-c:v", "libx264", "-crf", "23", "-preset", "medium", "-y", output]));

    match run_ffmpeg(&cmd).await {
        Ok(()) => {
            info!("✅ Videos with transitions combined: {}", output);
            Ok(())
        }
        Err(e) => {
            warn!("Transition render failed ({}), falling back to plain concatenation", e);
            combine_videos(&found, output).await
        }
    }
}

pub async fn add_audio(video: &str, audio: &str, output: &str) -> Result<()> {
    for p in [video, audio] {
        if !Path::new(p).exists() {
            bail!("File not found: {}", p);
        }
    }
    info!("🎵 Adding audio {} to {}", audio, video);
    let cmd = args([
        "-i", video, "-i", audio, "-c:v", "copy", "-c:a", "aac", "-b:a", "192k", "-map", "0:v:0", "-map",
        "1:a:0", "-shortest", "-y", output,
    ]);
    run_ffmpeg(&cmd).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concat_list_escapes_quotes() {
        let list = concat_list(&["/tmp/a.mp4".to_string(), "/tmp/it's.mp4".to_string()]);
        assert_eq!(list, "file '/tmp/a.mp4'\nfile '/tmp/it'\\''s.mp4'\n");
    }

    #[test]
    fn test_xfade_chain() {
        let (filter, last) = xfade_filter(3, 1.0);
        assert_eq!(
            filter,
            "[0][1]xfade=transition=fade:duration=1:offset=4[v1];\
             [v1][2]xfade=transition=fade:duration=1:offset=8[v2]"
        );
        assert_eq!(last, "v2");

        let (single, label) = xfade_filter(1, 1.0);
        assert!(single.is_empty());
        assert_eq!(label, "0");
    }

    #[tokio::test]
    async fn test_single_video_falls_back_to_copy() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let input = dir.path().join("scene_001.mp4");
        std::fs::write(&input, b"not really a video")?;
        let output = dir.path().join(COMBINED_VIDEO);

        combine_videos(
            &[input.to_string_lossy().to_string()],
            &output.to_string_lossy(),
        )
        .await?;

        assert_eq!(std::fs::read(&output)?, b"not really a video");
        Ok(())
    }

    #[tokio::test]
    async fn test_nothing_to_combine() {
        let err = combine_videos(&["/nonexistent/scene_001.mp4".to_string()], "/tmp/out.mp4")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("No videos"));
    }

    #[tokio::test]
    async fn test_add_audio_requires_inputs() {
        let err = add_audio("/nonexistent/v.mp4", "/nonexistent/a.mp3", "/tmp/x.mp4")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("File not found"));
    }
}
