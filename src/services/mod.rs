pub mod comfyui;
pub mod llm;
pub mod lora;
pub mod media;
pub mod record;
pub mod retry;
pub mod setup;
pub mod stages;
pub mod video;
pub mod workflow;
