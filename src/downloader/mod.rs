// 自适应下载模块

pub mod predictor;
pub mod streamer;

pub use predictor::{CalculatorPredictor, ParameterPredictor, PredictedParameters};
pub use streamer::{inspect_source, AdaptiveStreamer, SourceInfo, StreamStats, GZIP_MAGIC};
