//! Classification of inbound chat lines.
//!
//! Every text frame a client sends goes through [`Command::interpret`]
//! before the session decides whether to relay it, answer it privately, or
//! look up exchange rates.

/// Keyword that starts an exchange-rate query.
pub const EXCHANGE_KEYWORD: &str = "exchange";

/// Phrase that triggers the canned greeting reply.
pub const GREETING_PHRASE: &str = "Hello server";

/// Reply broadcast to everyone when a client greets the server.
pub const GREETING_REPLY: &str = "Привіт мої карапузи!";

/// Private reply for an `exchange` line that does not follow the grammar.
pub const MALFORMED_EXCHANGE_REPLY: &str =
    "Invalid command. Please use 'exchange' or 'exchange <index>' (2-10 days).";

/// What a single inbound line asks the server to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Relay the text verbatim to every connected client.
    Broadcast { text: String },
    /// Fetch rates for today minus `day_offset` days.
    ///
    /// `defaulted` is set when the client sent a bare `exchange`.
    ExchangeQuery { day_offset: i64, defaulted: bool },
    Greeting,
    /// Input that looked like a command but could not be parsed.
    Malformed { reason: String },
}

impl Command {
    /// Parses a raw line into a command.
    ///
    /// # Syntax
    /// - `exchange` - rates for today
    /// - `exchange <days>` - rates for `<days>` days ago (range checked later)
    /// - `Hello server` - greeting, matched exactly
    /// - anything else - broadcast as-is
    pub fn interpret(line: &str) -> Self {
        let mut parts = line.split_whitespace();

        if parts.next() != Some(EXCHANGE_KEYWORD) {
            if line == GREETING_PHRASE {
                return Command::Greeting;
            }
            return Command::Broadcast {
                text: line.to_string(),
            };
        }

        let rest: Vec<&str> = parts.collect();
        match rest.as_slice() {
            [] => Command::ExchangeQuery {
                day_offset: 0,
                defaulted: true,
            },
            [index] => match index.parse::<i64>() {
                Ok(day_offset) => Command::ExchangeQuery {
                    day_offset,
                    defaulted: false,
                },
                Err(_) => Command::malformed(),
            },
            _ => Command::malformed(),
        }
    }

    fn malformed() -> Self {
        Command::Malformed {
            reason: "bad exchange syntax".to_string(),
        }
    }
}
