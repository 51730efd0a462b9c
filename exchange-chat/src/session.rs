//! Per-connection read loop.
//!
//! A session walks `Connecting -> Active -> Closing -> Closed`. It registers
//! its handle on entry to `Active` and always unregisters on the way to
//! `Closed`, whatever ended the loop. Commands run one at a time in arrival
//! order; a close seen while one is in flight abandons it.

use std::{collections::VecDeque, fmt, sync::Arc};

use futures_util::{Stream, StreamExt};
use tracing::{debug, warn};

use crate::{
    broadcast::Broadcaster,
    command::{Command, GREETING_REPLY, MALFORMED_EXCHANGE_REPLY},
    exchange::ExchangeService,
    rates::ExchangeError,
    registry::{ConnectionHandle, ConnectionId, ConnectionRegistry},
};

/// Transport events a session reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Text(String),
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Active,
    Closing,
    Closed,
}

/// Everything shared between sessions.
#[derive(Clone)]
pub struct ChatState {
    pub registry: Arc<ConnectionRegistry>,
    pub broadcaster: Broadcaster,
    pub exchange: Arc<ExchangeService>,
}

impl ChatState {
    pub fn new(exchange: ExchangeService) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        Self {
            broadcaster: Broadcaster::new(Arc::clone(&registry)),
            registry,
            exchange: Arc::new(exchange),
        }
    }
}

pub struct Session {
    handle: ConnectionHandle,
    state: ChatState,
    phase: SessionState,
}

impl Session {
    pub fn new(handle: ConnectionHandle, state: ChatState) -> Self {
        Self {
            handle,
            state,
            phase: SessionState::Connecting,
        }
    }

    pub fn phase(&self) -> SessionState {
        self.phase
    }

    /// Drives the session until the client leaves. Returns the final state.
    pub async fn run<S, E>(mut self, inbound: S) -> SessionState
    where
        S: Stream<Item = Result<Inbound, E>>,
        E: fmt::Display,
    {
        let registration = Registration::acquire(&self.state.registry, self.handle.clone()).await;
        self.transition(SessionState::Active);

        let mut inbound = std::pin::pin!(inbound);
        // Lines that arrived while an earlier command was still running.
        let mut pending = VecDeque::new();
        'session: loop {
            let line = match pending.pop_front() {
                Some(line) => line,
                None => match self.next_line(inbound.next().await) {
                    Some(line) => line,
                    None => break,
                },
            };

            // Keep reading while a command runs so a departing client is
            // noticed without waiting on a slow upstream fetch.
            let mut dispatch = std::pin::pin!(self.dispatch(&line));
            loop {
                tokio::select! {
                    biased;
                    () = &mut dispatch => break,
                    event = inbound.next() => match self.next_line(event) {
                        Some(line) => pending.push_back(line),
                        None => break 'session,
                    },
                }
            }
        }

        self.transition(SessionState::Closing);
        registration.release().await;
        self.transition(SessionState::Closed);
        self.phase
    }

    /// Unwraps a text line, or `None` once the client is leaving.
    fn next_line<E: fmt::Display>(&self, event: Option<Result<Inbound, E>>) -> Option<String> {
        match event? {
            Ok(Inbound::Text(line)) => Some(line),
            Ok(Inbound::Close) => None,
            Err(err) => {
                debug!(id = self.handle.id(), error = %err, "transport error, closing session");
                None
            }
        }
    }

    fn transition(&mut self, next: SessionState) {
        debug!(id = self.handle.id(), from = ?self.phase, to = ?next, "session state change");
        self.phase = next;
    }

    async fn dispatch(&self, line: &str) {
        match Command::interpret(line) {
            Command::Broadcast { text } => {
                let message = format!("{}: {text}", self.handle.name());
                self.state.broadcaster.broadcast(&message).await;
            }
            Command::Greeting => {
                self.state.broadcaster.broadcast(GREETING_REPLY).await;
            }
            Command::Malformed { reason } => {
                debug!(id = self.handle.id(), %reason, "rejected command");
                self.reply(MALFORMED_EXCHANGE_REPLY);
            }
            Command::ExchangeQuery {
                day_offset,
                defaulted,
            } => self.exchange(day_offset, defaulted).await,
        }
    }

    async fn exchange(&self, day_offset: i64, defaulted: bool) {
        match self.state.exchange.resolve(day_offset).await {
            Ok(snapshot) => {
                self.state.broadcaster.broadcast(&snapshot.to_string()).await;
            }
            Err(err @ ExchangeError::InvalidRange { .. }) => self.reply(err.to_string()),
            Err(err) => {
                // Upstream trouble stays server-side; nobody gets a broadcast.
                warn!(
                    id = self.handle.id(),
                    day_offset,
                    defaulted,
                    error = %err,
                    "exchange query produced no rates"
                );
            }
        }
    }

    fn reply(&self, message: impl Into<String>) {
        if let Err(err) = self.handle.send(message) {
            debug!(id = self.handle.id(), error = %err, "failed to reply to client");
        }
    }
}

/// Registry membership tied to a session's lifetime.
///
/// Dropping without [`Registration::release`] (a panic or a cancelled task)
/// still removes the handle, from a spawned task.
struct Registration {
    registry: Arc<ConnectionRegistry>,
    id: ConnectionId,
    released: bool,
}

impl Registration {
    async fn acquire(registry: &Arc<ConnectionRegistry>, handle: ConnectionHandle) -> Self {
        let id = handle.id();
        registry.register(handle).await;
        Self {
            registry: Arc::clone(registry),
            id,
            released: false,
        }
    }

    async fn release(mut self) {
        self.registry.unregister(self.id).await;
        self.released = true;
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let registry = Arc::clone(&self.registry);
        let id = self.id;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    registry.unregister(id).await;
                });
            }
            Err(_) => warn!(id, "no runtime to unregister dropped session"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{convert::Infallible, time::Duration};

    use async_trait::async_trait;
    use chrono::Local;
    use futures_util::stream;
    use tokio::{sync::mpsc, time::timeout};

    use super::*;
    use crate::rates::{RateEntry, RateProvider, RatesResponse, query_date};

    struct FixedProvider(Result<RatesResponse, ExchangeError>);

    #[async_trait]
    impl RateProvider for FixedProvider {
        async fn fetch(&self, _date: &str) -> Result<RatesResponse, ExchangeError> {
            self.0.clone()
        }
    }

    fn chat_state(answer: Result<RatesResponse, ExchangeError>) -> ChatState {
        let service = ExchangeService::new(
            Arc::new(FixedProvider(answer)),
            vec!["USD".into(), "EUR".into()],
        );
        ChatState::new(service)
    }

    fn usd_rates() -> Result<RatesResponse, ExchangeError> {
        Ok(RatesResponse {
            exchange_rate: Some(vec![RateEntry::new("USD", 27.5, 27.0)]),
        })
    }

    async fn listener(
        state: &ChatState,
        name: &str,
    ) -> (ConnectionId, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = state.registry.next_id();
        state
            .registry
            .register(ConnectionHandle::new(id, name, None, tx))
            .await;
        (id, rx)
    }

    fn session(state: &ChatState, name: &str) -> (Session, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle::new(state.registry.next_id(), name, None, tx);
        (Session::new(handle, state.clone()), rx)
    }

    fn lines(items: &'static [&'static str]) -> impl Stream<Item = Result<Inbound, Infallible>> {
        let events: Vec<_> = items
            .iter()
            .map(|line| Ok(Inbound::Text(line.to_string())))
            .collect();
        stream::iter(events)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<String>) -> Option<String> {
        timeout(Duration::from_secs(1), rx.recv()).await.ok().flatten()
    }

    #[tokio::test]
    async fn chat_is_broadcast_with_sender_name() {
        let state = chat_state(usd_rates());
        let (_, mut bob) = listener(&state, "bob").await;
        let (alice, mut alice_rx) = session(&state, "alice");

        let final_state = alice.run(lines(&["hello"])).await;

        assert_eq!(final_state, SessionState::Closed);
        assert_eq!(next(&mut bob).await.as_deref(), Some("alice: hello"));
        assert_eq!(next(&mut alice_rx).await.as_deref(), Some("alice: hello"));
    }

    #[tokio::test]
    async fn greeting_reply_goes_to_everyone() {
        let state = chat_state(usd_rates());
        let (_, mut bob) = listener(&state, "bob").await;
        let (alice, _alice_rx) = session(&state, "alice");

        alice.run(lines(&["Hello server"])).await;

        assert_eq!(next(&mut bob).await.as_deref(), Some(GREETING_REPLY));
    }

    #[tokio::test]
    async fn malformed_and_out_of_range_replies_are_private() {
        let state = chat_state(usd_rates());
        let (_, mut bob) = listener(&state, "bob").await;
        let (alice, mut alice_rx) = session(&state, "alice");

        alice.run(lines(&["exchange abc", "exchange 11"])).await;

        assert_eq!(
            next(&mut alice_rx).await.as_deref(),
            Some(MALFORMED_EXCHANGE_REPLY)
        );
        assert_eq!(
            next(&mut alice_rx).await.as_deref(),
            Some(
                "Invalid index for exchange command. Please use 'exchange' or 'exchange <index>' (2-10 days)."
            )
        );
        assert!(bob.try_recv().is_err());
    }

    #[tokio::test]
    async fn exchange_result_is_broadcast_to_everyone() {
        let state = chat_state(usd_rates());
        let (_, mut bob) = listener(&state, "bob").await;
        let (alice, mut alice_rx) = session(&state, "alice");

        alice.run(lines(&["exchange 3"])).await;

        let date = query_date(Local::now().date_naive(), 3).expect("date");
        let expected = format!(
            r#"{{"{date}":{{"EUR":{{"sale":0.0,"purchase":0.0}},"USD":{{"sale":27.5,"purchase":27.0}}}}}}"#
        );
        assert_eq!(next(&mut bob).await, Some(expected.clone()));
        assert_eq!(next(&mut alice_rx).await, Some(expected));
    }

    #[tokio::test]
    async fn upstream_failures_are_silent() {
        let state = chat_state(Err(ExchangeError::UpstreamUnavailable {
            reason: "down".into(),
        }));
        let (_, mut bob) = listener(&state, "bob").await;
        let (alice, mut alice_rx) = session(&state, "alice");

        alice.run(lines(&["exchange", "still chatting"])).await;

        assert_eq!(next(&mut bob).await.as_deref(), Some("alice: still chatting"));
        assert_eq!(next(&mut alice_rx).await.as_deref(), Some("alice: still chatting"));
    }

    /// Holds every fetch for `delay`, or forever when `delay` is `None`.
    struct SlowProvider {
        delay: Option<Duration>,
    }

    #[async_trait]
    impl RateProvider for SlowProvider {
        async fn fetch(&self, _date: &str) -> Result<RatesResponse, ExchangeError> {
            match self.delay {
                Some(delay) => tokio::time::sleep(delay).await,
                None => std::future::pending::<()>().await,
            }
            usd_rates()
        }
    }

    fn slow_state(delay: Option<Duration>) -> ChatState {
        let service = ExchangeService::new(
            Arc::new(SlowProvider { delay }),
            vec!["USD".into(), "EUR".into()],
        );
        ChatState::new(service)
    }

    fn channel_stream() -> (
        mpsc::UnboundedSender<Result<Inbound, Infallible>>,
        impl Stream<Item = Result<Inbound, Infallible>>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let inbound = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });
        (tx, inbound)
    }

    #[tokio::test]
    async fn close_during_fetch_unregisters_promptly() {
        let state = slow_state(None);
        let (_, mut bob) = listener(&state, "bob").await;
        let (alice, _alice_rx) = session(&state, "alice");
        let id = alice.handle.id();

        let (tx, inbound) = channel_stream();
        let task = tokio::spawn(alice.run(inbound));
        tx.send(Ok(Inbound::Text("exchange".into()))).expect("send");
        tx.send(Ok(Inbound::Close)).expect("send close");

        let final_state = timeout(Duration::from_secs(1), task)
            .await
            .expect("session should not wait on the fetch")
            .expect("session task");
        assert_eq!(final_state, SessionState::Closed);
        assert!(!state.registry.contains(id).await);
        assert!(bob.try_recv().is_err());
    }

    #[tokio::test]
    async fn lines_sent_during_fetch_follow_the_result() {
        let state = slow_state(Some(Duration::from_millis(50)));
        let (_, mut bob) = listener(&state, "bob").await;
        let (alice, _alice_rx) = session(&state, "alice");

        let (tx, inbound) = channel_stream();
        let task = tokio::spawn(alice.run(inbound));
        tx.send(Ok(Inbound::Text("exchange 0".into()))).expect("send");
        tx.send(Ok(Inbound::Text("after".into()))).expect("send");

        let snapshot = next(&mut bob).await.expect("snapshot broadcast");
        assert!(snapshot.contains(r#""USD":{"sale":27.5,"purchase":27.0}"#));
        assert_eq!(next(&mut bob).await.as_deref(), Some("alice: after"));

        tx.send(Ok(Inbound::Close)).expect("send close");
        assert_eq!(task.await.expect("session task"), SessionState::Closed);
    }

    #[tokio::test]
    async fn session_is_registered_only_while_active() {
        let state = chat_state(usd_rates());
        let (alice, _alice_rx) = session(&state, "alice");
        let id = alice.handle.id();
        assert_eq!(alice.phase(), SessionState::Connecting);

        let (tx, rx) = mpsc::unbounded_channel::<Result<Inbound, Infallible>>();
        let inbound = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });
        let task = tokio::spawn(alice.run(inbound));

        tx.send(Ok(Inbound::Text("ping".into()))).expect("send");
        timeout(Duration::from_secs(1), async {
            while !state.registry.contains(id).await {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("session should register");

        tx.send(Ok(Inbound::Close)).expect("send close");
        let final_state = task.await.expect("session task");
        assert_eq!(final_state, SessionState::Closed);
        assert!(!state.registry.contains(id).await);
    }

    #[tokio::test]
    async fn transport_error_still_unregisters() {
        let state = chat_state(usd_rates());
        let (alice, _alice_rx) = session(&state, "alice");
        let id = alice.handle.id();

        let events = stream::iter(vec![
            Ok(Inbound::Text("hi".into())),
            Err("connection reset"),
            Ok(Inbound::Text("never read".into())),
        ]);
        let final_state = alice.run(events).await;

        assert_eq!(final_state, SessionState::Closed);
        assert!(!state.registry.contains(id).await);
    }

    #[tokio::test]
    async fn cancelled_session_is_cleaned_up() {
        let state = chat_state(usd_rates());
        let (alice, _alice_rx) = session(&state, "alice");
        let id = alice.handle.id();

        let task = tokio::spawn(alice.run(stream::pending::<Result<Inbound, Infallible>>()));
        timeout(Duration::from_secs(1), async {
            while !state.registry.contains(id).await {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("session should register");

        task.abort();
        let _ = task.await;
        timeout(Duration::from_secs(1), async {
            while state.registry.contains(id).await {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("dropped session should unregister");
    }
}
