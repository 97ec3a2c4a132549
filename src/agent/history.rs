use crate::providers::ChatMessage;

/// Smallest usable bound: both pinned messages plus one exchange.
const MIN_MAX_MESSAGES: usize = 4;

/// Conversation log for one navigation.
///
/// The system prompt and the goal turn are pinned at the front. Trimming
/// drops the oldest messages after them, so the model always sees the rules,
/// the goal and the most recent exchanges.
#[derive(Debug, Clone)]
pub struct ConversationHistory {
    messages: Vec<ChatMessage>,
    max_messages: usize,
    pinned: usize,
}

impl ConversationHistory {
    pub fn new(max_messages: usize) -> Self {
        Self {
            messages: Vec::new(),
            max_messages: max_messages.max(MIN_MAX_MESSAGES),
            pinned: 0,
        }
    }

    /// Reset to the pinned system prompt and goal turn.
    pub fn start(&mut self, system_prompt: impl Into<String>, goal: impl Into<String>) {
        self.messages = vec![ChatMessage::system(system_prompt), ChatMessage::user(goal)];
        self.pinned = self.messages.len();
    }

    pub fn push(&mut self, message: ChatMessage) {
        self.messages.push(message);
    }

    pub fn push_user(&mut self, content: impl Into<String>) {
        self.push(ChatMessage::user(content));
    }

    pub fn push_assistant(&mut self, content: impl Into<String>) {
        self.push(ChatMessage::assistant(content));
    }

    /// Drop the oldest unpinned messages until within bounds. Returns how many
    /// were removed.
    pub fn trim(&mut self) -> usize {
        if self.messages.len() <= self.max_messages {
            return 0;
        }
        let start = self.pinned.min(self.messages.len());
        let to_remove = (self.messages.len() - self.max_messages).min(self.messages.len() - start);
        self.messages.drain(start..start + to_remove);
        to_remove
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn max_messages(&self) -> usize {
        self.max_messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trim_keeps_pinned_and_recent() {
        let mut history = ConversationHistory::new(6);
        history.start("rules", "goal: log in");
        for i in 0..10 {
            history.push_user(format!("state {i}"));
            history.push_assistant(format!("action {i}"));
        }
        let removed = history.trim();

        assert_eq!(removed, 22 - 6);
        assert_eq!(history.len(), 6);
        let messages = history.messages();
        assert_eq!(messages[0], ChatMessage::system("rules"));
        assert_eq!(messages[1], ChatMessage::user("goal: log in"));
        assert_eq!(messages[2].content, "state 8");
        assert_eq!(messages[5].content, "action 9");
    }

    #[test]
    fn trim_is_noop_within_bounds() {
        let mut history = ConversationHistory::new(10);
        history.start("rules", "goal");
        history.push_user("state");
        assert_eq!(history.trim(), 0);
        assert_eq!(history.len(), 3);
    }

    #[test]
    fn bound_is_clamped() {
        let mut history = ConversationHistory::new(1);
        assert_eq!(history.max_messages(), 4);
        history.start("rules", "goal");
        for i in 0..5 {
            history.push_user(format!("m{i}"));
        }
        history.trim();
        assert_eq!(history.len(), 4);
        assert_eq!(history.messages()[0].role, "system");
        assert_eq!(history.messages()[1].content, "goal");
    }
}
