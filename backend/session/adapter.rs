//! Agent adapter: the uniform contract §4.8 describes around a
//! long-running CLI process. One concrete `ProcessAdapter` handles all
//! three agent kinds (tagged by `AgentKind`, not per-kind trait impls) since
//! the three CLIs differ only in argv and input-envelope shape, not in the
//! shape of the contract itself.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use crate::container::{ContainerDriver, ExecEvent, ExecOptions, ExecStream};
use crate::error::AppResult;
use crate::parser;
use crate::types::{AgentKind, Message};

#[derive(Debug, Clone)]
pub enum AdapterEvent {
    Message(Message),
    /// The agent CLI's own session id, learned from its first reply.
    NativeId(String),
    Error(String),
    Done,
}

#[async_trait]
pub trait Adapter: Send {
    async fn send_message(&mut self, text: &str) -> AppResult<()>;
    async fn set_model(&mut self, model: &str) -> AppResult<()>;
    async fn interrupt(&mut self) -> AppResult<()>;
    async fn dispose(&mut self) -> AppResult<()>;
    async fn next_event(&mut self) -> Option<AdapterEvent>;
}

pub struct ProcessAdapter {
    stream: ExecStream,
    model: Option<String>,
    line_buf: Vec<u8>,
    pending: VecDeque<AdapterEvent>,
    native_id_known: bool,
}

impl ProcessAdapter {
    pub async fn start(
        driver: Arc<ContainerDriver>,
        container_name: String,
        agent_kind: AgentKind,
        agent_native_id: Option<String>,
        model: Option<String>,
    ) -> AppResult<Self> {
        let mut argv = vec![agent_kind.as_str().to_string(), "--output-format".to_string(), "stream-json".to_string()];
        if let Some(native_id) = &agent_native_id {
            argv.push("--resume".to_string());
            argv.push(native_id.clone());
        }
        if let Some(model) = &model {
            argv.push("--model".to_string());
            argv.push(model.clone());
        }

        let stream = driver
            .exec_stream(&container_name, &argv, ExecOptions { env: BTreeMap::new(), ..Default::default() })
            .await?;

        Ok(Self {
            stream,
            model,
            line_buf: Vec::new(),
            pending: VecDeque::new(),
            native_id_known: agent_native_id.is_some(),
        })
    }
}

#[async_trait]
impl Adapter for ProcessAdapter {
    async fn send_message(&mut self, text: &str) -> AppResult<()> {
        let mut envelope = json!({ "type": "user", "content": text });
        if let Some(model) = &self.model {
            envelope["model"] = json!(model);
        }
        let mut line = envelope.to_string().into_bytes();
        line.push(b'\n');
        self.stream.write_stdin(&line).await
    }

    async fn set_model(&mut self, model: &str) -> AppResult<()> {
        // No restart: the new model rides in on the envelope of the next
        // `send_message` call.
        self.model = Some(model.to_string());
        Ok(())
    }

    /// Signals the running CLI process to cancel its in-flight turn, then
    /// discards anything already buffered from that turn. A subsequent
    /// `send_message` must never surface a message emitted before the
    /// interrupt (no-reuse-after-cancel, §8 property 4); since the adapter
    /// wraps a single long-running process rather than one-process-per-turn,
    /// that guarantee is enforced by flushing `pending`/`line_buf` here
    /// instead of replacing the underlying process.
    async fn interrupt(&mut self) -> AppResult<()> {
        let result = self.stream.write_stdin(&[0x03]).await;
        self.pending.clear();
        self.line_buf.clear();
        result
    }

    async fn dispose(&mut self) -> AppResult<()> {
        self.stream.kill().await
    }

    async fn next_event(&mut self) -> Option<AdapterEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }

            match self.stream.next_event().await {
                Some(ExecEvent::Stdout(bytes)) => {
                    self.line_buf.extend_from_slice(&bytes);
                    while let Some(pos) = self.line_buf.iter().position(|&b| b == b'\n') {
                        let line: Vec<u8> = self.line_buf.drain(..=pos).collect();
                        let text = String::from_utf8_lossy(&line);
                        let text = text.trim_end();

                        if !self.native_id_known {
                            if let Some(native_id) = parser::extract_native_id(text) {
                                self.native_id_known = true;
                                self.pending.push_back(AdapterEvent::NativeId(native_id));
                            }
                        }

                        self.pending.extend(parser::parse_line(text).into_iter().map(AdapterEvent::Message));
                    }
                }
                Some(ExecEvent::Stderr(bytes)) => {
                    let text = String::from_utf8_lossy(&bytes).trim().to_string();
                    if !text.is_empty() {
                        return Some(AdapterEvent::Error(text));
                    }
                }
                Some(ExecEvent::Exit { code }) => {
                    return Some(if code == 0 {
                        AdapterEvent::Done
                    } else {
                        AdapterEvent::Error(format!("agent process exited with code {code}"))
                    });
                }
                None => return None,
            }
        }
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;

    /// A no-op adapter for exercising `LiveSession` logic without a real
    /// container process.
    pub struct NullAdapter {
        disposed: bool,
    }

    impl NullAdapter {
        pub fn new() -> Self {
            Self { disposed: false }
        }
    }

    #[async_trait]
    impl Adapter for NullAdapter {
        async fn send_message(&mut self, _text: &str) -> AppResult<()> {
            Ok(())
        }

        async fn set_model(&mut self, _model: &str) -> AppResult<()> {
            Ok(())
        }

        async fn interrupt(&mut self) -> AppResult<()> {
            Ok(())
        }

        async fn dispose(&mut self) -> AppResult<()> {
            self.disposed = true;
            Ok(())
        }

        async fn next_event(&mut self) -> Option<AdapterEvent> {
            None
        }
    }
}
