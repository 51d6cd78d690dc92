pub mod consumer;
pub mod decoder;
pub mod downloader;
pub mod metadata;
pub mod pipeline;
pub mod publisher;
pub mod queue;
pub mod status;
pub mod storage;
pub mod transcoder;
