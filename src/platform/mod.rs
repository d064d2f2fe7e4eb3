pub mod telegram;

/// A message received from the chat transport
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    /// Chat identifier, checked against the allow-list
    pub chat_id: String,
    /// Display name of the sender, used for logging only
    pub user_name: String,
    /// The message text
    pub text: String,
}

/// Chat text split into a command name and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundCommand<'a> {
    /// `None` for free text
    pub name: Option<&'a str>,
    pub args: &'a str,
}

impl IncomingMessage {
    /// `/name@bot rest of text` parses to `name` and `rest of text`.
    /// Anything not starting with `/` is free text.
    pub fn command(&self) -> InboundCommand<'_> {
        let text = self.text.trim();
        let Some(body) = text.strip_prefix('/') else {
            return InboundCommand {
                name: None,
                args: text,
            };
        };

        let (head, args) = match body.split_once(char::is_whitespace) {
            Some((head, rest)) => (head, rest.trim()),
            None => (body, ""),
        };
        let name = head.split('@').next().unwrap_or(head);

        InboundCommand {
            name: if name.is_empty() { None } else { Some(name) },
            args,
        }
    }
}
