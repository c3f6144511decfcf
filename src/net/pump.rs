use crate::error::ChannelError;
use crate::io::byte_channel::OutputChannel;
use crate::net::connection::Connection;
use crate::runtime::LoopHandle;
use anyhow::Context;
use crossbeam::utils::Backoff;
use ringbuf::consumer::Consumer;
use ringbuf::traits::Split;
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const MAILBOX_CAP: usize = 4;

/// Completion events the loop thread sends back to a pump worker.
pub(crate) enum PumpEvent {
    WriteDone { err: Option<io::Error> },
    FinDone { sent: bool, err: Option<io::Error> },
}

/// SPSC mailbox: loop thread (producer) → pump worker (consumer).
pub(crate) fn mailbox() -> (HeapProd<PumpEvent>, HeapCons<PumpEvent>) {
    HeapRb::<PumpEvent>::new(MAILBOX_CAP).split()
}

/// Per-connection worker that drains the output channel onto the socket.
///
/// The pump blocks on the channel on its own thread, hops onto the loop
/// thread for every socket touch, and blocks on the mailbox for the write
/// completion the loop sends back.
pub(crate) struct OutputPump {
    conn: Arc<Connection>,
    channel: Arc<OutputChannel>,
    events: HeapCons<PumpEvent>,
    handle: LoopHandle,
}

impl OutputPump {
    pub fn spawn(
        conn: Arc<Connection>,
        channel: Arc<OutputChannel>,
        events: HeapCons<PumpEvent>,
        handle: LoopHandle,
    ) -> anyhow::Result<()> {
        let name = format!("looprt-pump-{}", conn.id());
        let pump = OutputPump {
            conn,
            channel,
            events,
            handle,
        };
        thread::Builder::new()
            .name(name)
            .spawn(move || pump.run())
            .context("failed to spawn output pump")?;
        Ok(())
    }

    fn run(mut self) {
        let outcome = self.pump_loop();
        if matches!(outcome, Err(ChannelError::Cancelled)) {
            self.write_fin();
        }
        self.release();
    }

    fn pump_loop(&mut self) -> Result<(), ChannelError> {
        loop {
            self.channel.wait_output()?;
            let Some(slice) = self.channel.snapshot() else {
                continue;
            };
            let end = slice.end;
            let count = slice.bufs.len();
            let total = slice.total_bytes;

            let Some(tok) = self.conn.token() else {
                self.channel.consumed(end);
                return Err(ChannelError::Closed);
            };

            let bufs = slice.bufs;
            let posted = self.handle.post(move |ctx| {
                ctx.submit_write(tok, bufs, total);
                Ok(())
            });
            if posted.is_err() {
                self.channel.consumed(end);
                return Err(ChannelError::Disposed);
            }

            match self.recv_event() {
                Ok(PumpEvent::WriteDone { err: None }) => {
                    tracing::debug!(
                        conn = %self.conn.id(),
                        bytes = total,
                        bufs = count,
                        "[OutputPump] write callback"
                    );
                }
                Ok(PumpEvent::WriteDone { err: Some(e) }) => {
                    crate::error_throttled!(
                        Duration::from_secs(1),
                        conn = %self.conn.id(),
                        error = %e,
                        "[OutputPump] connection error"
                    );
                    self.conn.abort();
                }
                Ok(PumpEvent::FinDone { .. }) => {}
                Err(_) => {
                    self.channel.consumed(end);
                    return Err(ChannelError::Closed);
                }
            }

            self.channel.consumed(end);

            if self.conn.is_socket_closed() {
                return Ok(());
            }
        }
    }

    /// Cancellation path: half-close the write side unless the socket is
    /// already gone, and wait for the FIN status.
    fn write_fin(&mut self) {
        if self.conn.is_socket_closed() {
            return;
        }
        let Some(tok) = self.conn.token() else {
            return;
        };
        let posted = self.handle.post(move |ctx| {
            ctx.shutdown_write(tok);
            Ok(())
        });
        if posted.is_err() {
            return;
        }

        loop {
            match self.recv_event() {
                Ok(PumpEvent::FinDone { sent: true, err: None }) => {
                    tracing::debug!(conn = %self.conn.id(), "[OutputPump] wrote FIN");
                    break;
                }
                Ok(PumpEvent::FinDone { sent: true, err: Some(e) }) => {
                    tracing::debug!(conn = %self.conn.id(), error = %e, "[OutputPump] FIN failed");
                    break;
                }
                Ok(PumpEvent::FinDone { sent: false, .. }) => break,
                // straggler from an aborted write
                Ok(PumpEvent::WriteDone { .. }) => continue,
                Err(_) => break,
            }
        }
    }

    /// Always runs, success or failure: close the socket through the close
    /// queue, notify the connection once, release the channel's blocks.
    fn release(self) {
        self.conn.queue_socket_close();
        self.conn.notify_socket_closed();
        self.channel.dispose();
        tracing::debug!(conn = %self.conn.id(), "[OutputPump] connection stopped");
    }

    /// Wait for the next mailbox event. Falls back to the disposed/closed
    /// flags so a dead loop cannot strand the worker.
    fn recv_event(&mut self) -> Result<PumpEvent, ChannelError> {
        let backoff = Backoff::new();
        let mut spins: u32 = 0;

        loop {
            if let Some(ev) = self.events.try_pop() {
                return Ok(ev);
            }
            if self.handle.is_disposed() || self.conn.is_socket_closed() {
                // the loop may have pushed right before it went away
                if let Some(ev) = self.events.try_pop() {
                    return Ok(ev);
                }
                return Err(ChannelError::Closed);
            }

            spins = spins.saturating_add(1);
            if spins < 64 {
                backoff.spin();
            } else if spins < 256 {
                backoff.snooze();
            } else {
                thread::sleep(Duration::from_millis(1));
            }
        }
    }
}
