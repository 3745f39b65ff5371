//! Prompt templates and user-facing copy.

/// System prompt applied to sessions that never had one set.
pub const DEFAULT_SYSTEM_PROMPT: &str = r#####"
You are a helpful assistant living inside a team chat app.  Answer concisely, use the chat app's markdown
formatting where it helps, and ask a clarifying question when a request is ambiguous.  When a message asks
you to summarize a web page, fetch it with the `fetch_url` tool before answering.
"#####;

/// Help card body.
pub const HELP_TEXT: &str = r#####"
*命令列表*

• `/clear` 或 `清除`：开始新的话题（需要确认）
• `/system <提示词>` 或 `角色扮演 <提示词>`：以自定义系统提示词重新开始话题
• `/roles` 或 `角色列表`：按类别浏览内置角色
• `/ai_mode` 或 `发散模式`：选择回复风格
• `/summary <网址>` 或 `总结 <网址>`：总结网页内容
• `/balance` 或 `余额`：查询 API 余额
• `/help` 或 `帮助`：显示本帮助

其他消息都会作为当前话题的一部分发送给机器人。
"#####;

/// Reply sent when the balance query fails.
pub const BALANCE_FAILED: &str = "查询余额失败，请稍后再试";

/// Notice sent before a summary, since tool-augmented completions are slow.
pub const SUMMARY_WORKING: &str = "本次对话进入总结外部网页功能，暂无法通过流式传输，请稍候片刻，本次查询预计花费10~20s。如长时间无响应请重新请求";

/// Notice shown once a session has been cleared.
pub const SESSION_CLEARED: &str = "🤖️：已清除此话题的上下文信息";

/// Notice shown when the user backs out of clearing a session.
pub const SESSION_KEPT: &str = "🤖️：你选择保留此话题的上下文信息";

/// Notice shown when a picked role is no longer in the role list.
pub const ROLE_NOT_FOUND: &str = "🤖️：未找到该角色，请重新选择";

/// Reply sent when a completion fails.
pub fn completion_failed(err: &anyhow::Error) -> String {
    format!("🤖️：消息机器人摆烂了，请稍后再试～\n错误信息: {err}")
}

/// Reply sent once a session's mode has been changed.
pub fn mode_selected(mode: &str) -> String {
    format!("🤖️：已切换到 `{mode}` 模式")
}
