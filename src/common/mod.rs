//! 公共模块
//!
//! 提供跨模块使用的通用组件

mod format;

pub use format::{format_bytes, format_eta, infer_mime_type};
