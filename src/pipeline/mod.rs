//! 推理流水线：分类抽取 → 条件生成
//!
//! 两节点严格顺序执行，生成提示依赖分类节点刚写入的事实/事件可被检索到。
//! audio_mode 为 true 时生成节点短路（语音端点负责开口，流水线只做记忆副作用）。

pub mod driver;
pub mod generation;
pub mod reasoning;
pub mod state;

pub use driver::PipelineDriver;
pub use generation::GenerationNode;
pub use reasoning::{IntentCategory, ReasoningNode, ReasoningResult};
pub use state::PipelineState;
