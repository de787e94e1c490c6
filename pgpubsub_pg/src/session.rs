//! The listening connection session.
//!
//! A session owns one database connection dedicated to `LISTEN`. It never
//! participates in user transactions: a poll that times out costs no
//! server-side work, and notification delivery is driven entirely by the
//! server pushing onto the socket.

use std::collections::HashSet;
use std::time::Duration;

use log::{debug, info};
use sqlx::PgPool;
use sqlx::postgres::PgListener;

/// Errors from the listening connection.
///
/// Any connection-level error is fatal to the session; the owning worker
/// terminates and the supervisor restarts it with a fresh subscription.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The underlying connection failed.
    #[error("listen connection failed: {0}")]
    Connection(#[from] sqlx::Error),

    /// The server closed the connection (socket reset, admin termination).
    /// Notifications may have been missed; only a fresh worker with a
    /// recovery pass can make up for them.
    #[error("listen connection was lost")]
    ConnectionLost,
}

/// One notification as received from the server.
#[derive(Debug, Clone)]
pub struct ReceivedNotification {
    /// The channel the notification was sent on.
    pub channel: String,
    /// The raw payload text.
    pub payload: String,
    /// Backend PID of the notifying session.
    pub pid: u32,
}

/// Outcome of a bounded poll.
#[derive(Debug)]
pub enum Polled {
    /// A notification arrived within the deadline.
    Notification(ReceivedNotification),
    /// The deadline elapsed with nothing to deliver.
    Timeout,
}

/// A dedicated listening connection with its subscription set.
pub struct ListenSession {
    listener: PgListener,
    subscribed: HashSet<String>,
}

impl ListenSession {
    /// Opens a listening connection using the pool's connect options.
    pub async fn connect(pool: &PgPool) -> Result<Self, SessionError> {
        let listener = PgListener::connect_with(pool).await?;
        Ok(Self {
            listener,
            subscribed: HashSet::new(),
        })
    }

    /// Issues `LISTEN` for each channel. Idempotent for a given session;
    /// channel names are quoted per PostgreSQL identifier rules by the
    /// driver.
    pub async fn subscribe(&mut self, channels: &[&str]) -> Result<(), SessionError> {
        for channel in channels {
            if self.subscribed.contains(*channel) {
                debug!("already listening on '{channel}'");
                continue;
            }
            self.listener.listen(channel).await?;
            self.subscribed.insert((*channel).to_string());
            info!("listening on channel '{channel}'");
        }
        Ok(())
    }

    /// The channels this session is subscribed to.
    pub fn subscriptions(&self) -> impl Iterator<Item = &str> {
        self.subscribed.iter().map(String::as_str)
    }

    /// Blocks up to `deadline` waiting for the next notification.
    ///
    /// Buffered notifications return immediately, so a burst is drained by
    /// successive polls without further waiting. `try_recv` is used rather
    /// than `recv` because only it surfaces a lost connection instead of
    /// silently reconnecting; a silent reconnect would drop notifications
    /// without anyone noticing.
    pub async fn poll(&mut self, deadline: Duration) -> Result<Polled, SessionError> {
        match tokio::time::timeout(deadline, self.listener.try_recv()).await {
            Err(_elapsed) => Ok(Polled::Timeout),
            Ok(Ok(Some(notification))) => Ok(Polled::Notification(ReceivedNotification {
                channel: notification.channel().to_string(),
                payload: notification.payload().to_string(),
                pid: notification.process_id(),
            })),
            Ok(Ok(None)) => Err(SessionError::ConnectionLost),
            Ok(Err(e)) => Err(SessionError::Connection(e)),
        }
    }

    /// Releases the connection.
    pub async fn close(mut self) -> Result<(), SessionError> {
        self.listener.unlisten_all().await?;
        Ok(())
    }
}
