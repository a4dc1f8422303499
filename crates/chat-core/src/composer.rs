use crate::error::SessionResult;
use crate::session::{ChatSession, Submission};
use crate::settings::ComposerSettings;

/// Prefix that opens a completion popup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerKind {
    /// `/name`
    Command,
    /// `@name`
    Mention,
}

impl TriggerKind {
    fn from_char(symbol: char) -> Option<Self> {
        match symbol {
            '/' => Some(Self::Command),
            '@' => Some(Self::Mention),
            _ => None,
        }
    }
}

/// Trigger word under the cursor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trigger {
    pub kind: TriggerKind,
    /// Text typed after the trigger symbol, up to the cursor.
    pub query: String,
    /// Char index of the trigger symbol.
    pub start: usize,
}

#[derive(Debug)]
pub enum SendOutcome {
    /// The session was pending; the send button acted as stop.
    Stopped,
    /// Nothing but whitespace in the draft.
    Ignored,
    Sent(Submission),
}

/// Draft state behind the text sender. The send button doubles as stop while
/// the session is pending.
#[derive(Debug, Clone)]
pub struct Composer {
    draft: String,
    cursor: usize,
    settings: ComposerSettings,
}

impl Composer {
    pub fn new(settings: ComposerSettings) -> Self {
        Self {
            draft: String::new(),
            cursor: 0,
            settings,
        }
    }

    pub fn draft(&self) -> &str {
        &self.draft
    }

    pub fn placeholder(&self) -> &str {
        &self.settings.placeholder
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn char_count(&self) -> usize {
        self.draft.chars().count()
    }

    pub fn char_limit(&self) -> usize {
        self.settings.char_limit
    }

    pub fn over_limit(&self) -> bool {
        self.char_count() > self.settings.char_limit
    }

    /// Replaces the draft and moves the cursor to its end.
    pub fn set_draft(&mut self, draft: impl Into<String>) {
        self.draft = draft.into();
        self.cursor = self.char_count();
    }

    pub fn set_cursor(&mut self, cursor: usize) {
        self.cursor = cursor.min(self.char_count());
    }

    /// Inserts `text` at the cursor and advances past it.
    pub fn insert(&mut self, text: &str) {
        let offset = self.byte_offset(self.cursor);
        self.draft.insert_str(offset, text);
        self.cursor += text.chars().count();
    }

    pub fn clear(&mut self) {
        self.draft.clear();
        self.cursor = 0;
    }

    pub fn is_sending(&self, session: &ChatSession) -> bool {
        session.pending()
    }

    /// Send button: stops a pending request, otherwise submits the draft.
    pub fn send(&mut self, session: &ChatSession) -> SessionResult<SendOutcome> {
        if session.pending() {
            session.cancel();
            return Ok(SendOutcome::Stopped);
        }

        if self.draft.trim().is_empty() {
            return Ok(SendOutcome::Ignored);
        }

        let prompt = self
            .draft
            .strip_suffix('\n')
            .unwrap_or(&self.draft)
            .to_string();
        let submission = session.submit(prompt)?;
        self.clear();
        Ok(SendOutcome::Sent(submission))
    }

    /// Enter sends; shift+enter inserts a newline and returns `None`.
    pub fn handle_enter(
        &mut self,
        shift: bool,
        session: &ChatSession,
    ) -> SessionResult<Option<SendOutcome>> {
        if shift {
            if !session.pending() {
                self.insert("\n");
            }
            return Ok(None);
        }
        self.send(session).map(Some)
    }

    /// Finds a `/command` or `@mention` word ending at the cursor.
    pub fn active_trigger(&self) -> Option<Trigger> {
        let before: Vec<char> = self.draft.chars().take(self.cursor).collect();
        let word_start = before
            .iter()
            .rposition(|symbol| symbol.is_whitespace())
            .map_or(0, |index| index + 1);
        let kind = TriggerKind::from_char(*before.get(word_start)?)?;

        Some(Trigger {
            kind,
            query: before[word_start + 1..].iter().collect(),
            start: word_start,
        })
    }

    /// Replaces the active trigger's query with `value` plus a trailing space.
    /// Returns false when the cursor is not on a trigger word.
    pub fn complete(&mut self, value: &str) -> bool {
        let Some(trigger) = self.active_trigger() else {
            return false;
        };

        let from = self.byte_offset(trigger.start + 1);
        let to = self.byte_offset(self.cursor);
        let replacement = format!("{value} ");
        self.draft.replace_range(from..to, &replacement);
        self.cursor = trigger.start + 1 + replacement.chars().count();
        true
    }

    fn byte_offset(&self, char_index: usize) -> usize {
        self.draft
            .char_indices()
            .nth(char_index)
            .map_or(self.draft.len(), |(offset, _)| offset)
    }
}

impl Default for Composer {
    fn default() -> Self {
        Self::new(ComposerSettings::default())
    }
}
