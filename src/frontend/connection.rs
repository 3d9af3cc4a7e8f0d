use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::select;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::ErrorResponse;
use crate::gateway::{ClientContext, CommandError, Gateway, RequestError};
use crate::store::MemoryConnector;

use super::buffers::FrontendBuffers;
use super::commands::{BuiltinCommands, Command};

// -----------------------------------------------------------------------------
// ----- Constants -------------------------------------------------------------

pub const GREETING: &str = "WELCOME|shelfcrab";

// -----------------------------------------------------------------------------
// ----- FrontendConnection ----------------------------------------------------

/// One client connection. Requests are handled strictly one after another;
/// replies are batched and flushed once per read.
#[derive(Debug)]
pub struct FrontendConnection<S> {
    stream: S,
    buffers: FrontendBuffers,
    client: ClientContext,

    gateway: Arc<Gateway<MemoryConnector>>,
    commands: Arc<BuiltinCommands>,
    shutdown: watch::Receiver<bool>,

    close_after_flush: bool,
}

// -----------------------------------------------------------------------------
// ----- FrontendConnection: Static --------------------------------------------

impl<S> FrontendConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// `client_id` keys admission control; the peer address for TCP clients.
    pub fn new(
        stream: S,
        client_id: impl Into<String>,
        gateway: Arc<Gateway<MemoryConnector>>,
        commands: Arc<BuiltinCommands>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let client = gateway.open_client(client_id);

        Self {
            stream,
            buffers: FrontendBuffers::new(),
            client,
            gateway,
            commands,
            shutdown,
            close_after_flush: false,
        }
    }
}

// -----------------------------------------------------------------------------
// ----- FrontendConnection: Public --------------------------------------------

impl<S> FrontendConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub async fn serve(mut self) -> std::io::Result<()> {
        let result = self.serve_inner().await;
        self.gateway.close_client(&mut self.client);
        debug!(client = %self.client.client_id(), "connection closed");
        result
    }
}

// -----------------------------------------------------------------------------
// ----- FrontendConnection: Private -------------------------------------------

impl<S> FrontendConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn serve_inner(&mut self) -> std::io::Result<()> {
        self.buffers.queue_line(GREETING);
        self.buffers.flush_to(&mut self.stream).await?;

        loop {
            select! {
                biased;

                // -- Server shutdown --
                Ok(()) = self.shutdown.changed() => {
                    if *self.shutdown.borrow() {
                        let err = ErrorResponse::unavailable("server is shutting down").fatal();
                        self.buffers.queue_response(&err.to_bytes());
                        self.buffers.flush_to(&mut self.stream).await?;
                        info!(client = %self.client.client_id(), "closing connection for shutdown");
                        break;
                    }
                }

                // -- Client requests --
                read_res = self.buffers.read_from(&mut self.stream) => {
                    let n = read_res?;
                    if n == 0 { break; }

                    // 1) process every complete line in the inbox
                    self.process_lines().await;

                    // 2) flush replies
                    self.buffers.flush_to(&mut self.stream).await?;

                    if self.close_after_flush { break; }
                }
            }
        }

        Ok(())
    }

    async fn process_lines(&mut self) {
        while !self.close_after_flush {
            match self.buffers.next_line() {
                Ok(Some(line)) => self.process_line(line).await,
                Ok(None) => break,
                Err(err) => {
                    debug!(client = %self.client.client_id(), "{err}");
                    let err = ErrorResponse::protocol_violation(err.to_string());
                    self.buffers.queue_response(&err.to_bytes());
                    self.close_after_flush = true;
                }
            }
        }
    }

    async fn process_line(&mut self, line: BytesMut) {
        if line.iter().all(u8::is_ascii_whitespace) {
            return;
        }

        let command = match std::str::from_utf8(&line) {
            Ok(text) => Command::parse(text),
            Err(_) => Command::Malformed(CommandError::BadRequest(
                "request is not valid UTF-8".to_string(),
            )),
        };

        match self
            .gateway
            .dispatch(self.commands.as_ref(), &mut self.client, &command)
            .await
        {
            Ok(outcome) => {
                self.buffers.queue_line(&outcome.reply);
                if outcome.closes() {
                    self.close_after_flush = true;
                }
            }
            Err(err) => {
                if !matches!(err, RequestError::RateLimited) {
                    debug!(client = %self.client.client_id(), error = %err, "request failed");
                }
                let response = ErrorResponse::from(&err);
                self.buffers.queue_response(&response.to_bytes());
                if response.fatal {
                    self.close_after_flush = true;
                }
            }
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Tests -----------------------------------------------------------------
