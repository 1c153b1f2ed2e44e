// 转换服务器 API 模块

pub mod client;
pub mod types;

pub use client::{HttpUploadClient, UploadTransport};
pub use types::*;
