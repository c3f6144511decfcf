use crate::error::ChannelError;
use crate::io::byte_channel::OutputChannel;
use crate::net::manager::ConnectionManager;
use crate::net::pump::{self, OutputPump};
use crate::runtime::{LoopHandle, LoopThread};
use crate::utils::HealthFlag;
use anyhow::Context;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use uuid::Uuid;
use uuid::fmt::Simple;

const REGISTER_TIMEOUT: Duration = Duration::from_secs(5);

/// One live client connection.
///
/// The socket handle lives in the loop's registry and is touched only on
/// the loop thread; response bytes flow through the output channel, and the
/// pump worker moves them onto the socket.
pub struct Connection {
    id: Simple,
    handle: LoopHandle,
    output: Arc<OutputChannel>,
    manager: Arc<ConnectionManager>,
    token: OnceLock<usize>,
    alive: HealthFlag,
    close_queued: AtomicBool,
    notified: AtomicBool,
}

impl Connection {
    /// Bind an accepted socket to the loop: registers the handle on the
    /// loop thread, starts the output pump, and tracks the connection.
    pub fn attach(lt: &LoopThread, stream: std::net::TcpStream) -> anyhow::Result<Arc<Connection>> {
        stream
            .set_nonblocking(true)
            .context("failed to switch socket to non-blocking")?;
        let stream = mio::net::TcpStream::from_std(stream);

        let (events_tx, events_rx) = pump::mailbox();
        let output = Arc::new(OutputChannel::new(lt.buffer_pool().clone()));
        let conn = Arc::new(Connection {
            id: Uuid::new_v4().simple(),
            handle: lt.handle(),
            output: output.clone(),
            manager: lt.connections().clone(),
            token: OnceLock::new(),
            alive: HealthFlag::new(true),
            close_queued: AtomicBool::new(false),
            notified: AtomicBool::new(false),
        });

        let waiter = {
            let conn = conn.clone();
            lt.handle().post_waitable(move |ctx| {
                let tok = ctx.register_stream(stream, conn.id, conn.alive.clone(), events_tx)?;
                let _ = conn.token.set(tok);
                Ok(())
            })
        }
        .context("failed to post connection registration")?;

        waiter
            .wait(Some(REGISTER_TIMEOUT))
            .context("failed to register connection with the loop")?;

        lt.connections().register(conn.clone());
        OutputPump::spawn(conn.clone(), output, events_rx, lt.handle())?;

        tracing::debug!(conn = %conn.id, "[Connection] attached");
        Ok(conn)
    }

    #[inline]
    pub fn id(&self) -> Simple {
        self.id
    }

    /// Producer side: append response bytes to the output channel.
    pub fn write(&self, data: &[u8]) -> Result<(), ChannelError> {
        self.output.write(data)
    }

    /// Producer side: no further bytes will be written.
    pub fn close_output(&self) {
        self.output.close();
    }

    /// Cooperatively stop the pump; it observes this on its next wait.
    pub fn cancel_output(&self) {
        self.output.cancel();
    }

    /// Whether the socket handle has been disposed on the loop thread.
    #[inline]
    pub fn is_socket_closed(&self) -> bool {
        !self.alive.get()
    }

    /// Abort the connection: cancel the output and dispose the socket
    /// without flushing. Pump cleanup still runs.
    pub fn abort(&self) {
        self.output.cancel();
        self.queue_socket_close();
    }

    pub(crate) fn token(&self) -> Option<usize> {
        self.token.get().copied()
    }

    /// Route the socket close through the close queue, at most once.
    pub(crate) fn queue_socket_close(&self) {
        if self.close_queued.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(tok) = self.token() {
            let _ = self.handle.queue_close(move |ctx| {
                ctx.dispose_handle(tok);
                Ok(())
            });
        }
    }

    /// Exactly-once socket-closed notification.
    pub(crate) fn notify_socket_closed(&self) {
        if self.notified.swap(true, Ordering::AcqRel) {
            return;
        }
        self.manager.deregister(&self.id);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // drop glue must not wake the loop; the next wake or the closing
        // pass picks the item up
        if self.close_queued.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(tok) = self.token() {
            self.handle.queue_close_async(move |ctx| {
                ctx.dispose_handle(tok);
                Ok(())
            });
        }
    }
}
