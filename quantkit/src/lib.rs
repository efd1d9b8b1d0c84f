//! Post-training quantization of framework agnostic graphs: calibration statistics,
//! threshold selection per error method, and the correction passes that keep the quantized
//! graph close to the float one.
pub mod config;
pub mod graph;
pub mod passes;
pub mod pipeline;
pub mod quantization;
pub mod statistics;
pub mod target_platform;
pub mod tensor;
pub mod testing;

pub use config::{
    BIT_LEN, CustomOpsetLayers, ConfigError, DEFAULT_CONFIG, QuantizationConfig,
    QuantizationErrorMethod,
};
pub use graph::{Graph, GraphError, Node, NodeId, Operator};
pub use passes::{CorrectionError, PassOutcome};
pub use pipeline::{QuantizedModel, RunReport, quantize};
pub use quantization::{
    HessianScores, NoHessianScores, QuantizationGrid, QuantizationMethod, StaticHessianScores,
};
pub use statistics::{NodeStatistics, StatisticsCollector, StatisticsError};
pub use target_platform::{FrameworkInfo, TargetPlatformCapabilities};
pub use tensor::{Tensor, TensorError};
