//! Operator confirmation for incoming pairing requests.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::io::Stdin;
use tokio::sync::Mutex;
use tracing::debug;
use tracing::warn;

/// Operator's answer to a pairing prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Yes,
    No,
}

/// Presents a yes/no decision to an operator.
///
/// The answer may take arbitrarily long; only the calling device's flow waits.
#[async_trait]
pub trait ConfirmationGateway: Send + Sync {
    async fn confirm(&self, title: &str, message: &str) -> Confirmation;
}

/// Prompt title and message for a pairing request.
pub fn pairing_prompt(display_name: &str) -> (String, String) {
    (
        format!("Pair {}?", display_name),
        format!("Are you sure you want to pair {}?", display_name),
    )
}

/// Answers every prompt the same way. For headless deployments.
#[derive(Debug, Clone, Copy)]
pub struct PolicyGateway(pub Confirmation);

#[async_trait]
impl ConfirmationGateway for PolicyGateway {
    async fn confirm(&self, title: &str, _message: &str) -> Confirmation {
        debug!("{} -> {:?} (policy)", title, self.0);
        self.0
    }
}

/// Asks on the controlling terminal.
pub struct ConsoleGateway {
    stdin: Mutex<BufReader<Stdin>>,
}

impl ConsoleGateway {
    pub fn new() -> Self {
        Self {
            stdin: Mutex::new(BufReader::new(tokio::io::stdin())),
        }
    }
}

impl Default for ConsoleGateway {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConfirmationGateway for ConsoleGateway {
    async fn confirm(&self, title: &str, message: &str) -> Confirmation {
        // One prompt owns the terminal at a time
        let mut stdin = self.stdin.lock().await;
        let mut stdout = tokio::io::stdout();

        loop {
            let prompt = format!("{}\n{} [y/n] ", title, message);
            if let Err(e) = stdout.write_all(prompt.as_bytes()).await {
                warn!("Failed to write prompt: {}", e);
                return Confirmation::No;
            }
            let _ = stdout.flush().await;

            let mut line = String::new();
            match stdin.read_line(&mut line).await {
                Ok(0) => return Confirmation::No,
                Ok(_) => {
                    if let Some(answer) = parse_answer(&line) {
                        return answer;
                    }
                }
                Err(e) => {
                    warn!("Failed to read answer: {}", e);
                    return Confirmation::No;
                }
            }
        }
    }
}

fn parse_answer(line: &str) -> Option<Confirmation> {
    match line.trim().to_lowercase().as_str() {
        "y" | "yes" => Some(Confirmation::Yes),
        "n" | "no" => Some(Confirmation::No),
        _ => None,
    }
}

/// Answers `No` if the wrapped gateway has not answered within `timeout`.
pub struct TimeoutGateway<G> {
    inner: G,
    timeout: Duration,
}

impl<G> TimeoutGateway<G> {
    pub fn new(inner: G, timeout: Duration) -> Self {
        Self { inner, timeout }
    }
}

#[async_trait]
impl<G: ConfirmationGateway> ConfirmationGateway for TimeoutGateway<G> {
    async fn confirm(&self, title: &str, message: &str) -> Confirmation {
        match tokio::time::timeout(self.timeout, self.inner.confirm(title, message)).await {
            Ok(answer) => answer,
            Err(_) => {
                warn!("{} unanswered after {:?}, rejecting", title, self.timeout);
                Confirmation::No
            }
        }
    }
}

/// Keeps at most one prompt outstanding across all devices.
pub struct SerialGateway<G> {
    inner: G,
    turn: Mutex<()>,
}

impl<G> SerialGateway<G> {
    pub fn new(inner: G) -> Self {
        Self {
            inner,
            turn: Mutex::new(()),
        }
    }
}

#[async_trait]
impl<G: ConfirmationGateway> ConfirmationGateway for SerialGateway<G> {
    async fn confirm(&self, title: &str, message: &str) -> Confirmation {
        let _turn = self.turn.lock().await;
        self.inner.confirm(title, message).await
    }
}

#[async_trait]
impl ConfirmationGateway for Box<dyn ConfirmationGateway> {
    async fn confirm(&self, title: &str, message: &str) -> Confirmation {
        (**self).confirm(title, message).await
    }
}
