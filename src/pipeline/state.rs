//! 流水线共享状态
//!
//! 显式字段的类型化记录：缺键/改名在编译期暴露，而不是运行时取空。

use crate::memory::{Message, UserProfile};

/// 一次话语经过两节点流水线的全部状态
#[derive(Debug, Clone)]
pub struct PipelineState {
    /// 冲刷出的完整话语文本
    pub input_text: String,
    pub username: String,
    /// 进入流水线时的对话历史快照
    pub chat_history: Vec<Message>,
    pub profile: UserProfile,
    /// true = 语音端点负责口头回复，跳过生成节点
    pub audio_mode: bool,
    /// 分类节点产出的上下文摘要
    pub reasoning_context: String,
    /// 生成节点产出的文本回复（audio_mode 下为空）
    pub final_response: String,
}

impl PipelineState {
    pub fn new(
        input_text: impl Into<String>,
        username: impl Into<String>,
        chat_history: Vec<Message>,
        profile: UserProfile,
        audio_mode: bool,
    ) -> Self {
        Self {
            input_text: input_text.into(),
            username: username.into(),
            chat_history,
            profile,
            audio_mode,
            reasoning_context: String::new(),
            final_response: String::new(),
        }
    }
}
