pub mod chunked;
pub mod file_service;
pub mod metadata;
pub mod offload;
pub mod remote;
pub mod retention;
pub mod retrieval;
pub mod staging;
