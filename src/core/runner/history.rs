use std::collections::VecDeque;

use crate::core::browser::BrowserAction;

/// One completed round: what the page looked like, what was done, what happened.
#[derive(Debug, Clone, PartialEq)]
pub struct Exchange {
    pub url: String,
    pub screenshot: Option<String>,
    pub action: BrowserAction,
    pub reasoning: Option<String>,
    pub outcome: String,
}

/// Conversation sent to the vision model: a fixed instruction head plus a
/// sliding window of the most recent exchanges.
#[derive(Debug, Clone)]
pub struct ConversationHistory {
    instruction: String,
    exchanges: VecDeque<Exchange>,
    max_exchanges: usize,
}

impl ConversationHistory {
    pub fn new(instruction: impl Into<String>, max_exchanges: usize) -> Self {
        Self {
            instruction: instruction.into(),
            exchanges: VecDeque::new(),
            max_exchanges: max_exchanges.max(1),
        }
    }

    pub fn instruction(&self) -> &str {
        &self.instruction
    }

    pub fn exchanges(&self) -> impl Iterator<Item = &Exchange> {
        self.exchanges.iter()
    }

    pub fn len(&self) -> usize {
        self.exchanges.len()
    }

    pub fn push(&mut self, exchange: Exchange) {
        self.exchanges.push_back(exchange);
        self.trim();
    }

    /// Drops the oldest exchanges beyond the window. The instruction is never dropped.
    pub fn trim(&mut self) {
        while self.exchanges.len() > self.max_exchanges {
            self.exchanges.pop_front();
        }
    }
}
