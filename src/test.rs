#[cfg(test)]
mod tests {
    use crate::config::LoopConfig;
    use crate::net::connection::Connection;
    use crate::runtime::LoopThread;
    use crate::utils::AppLifetime;
    use std::io::Read;
    use std::net::{TcpListener, TcpStream};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    struct StopProbe {
        hit: AtomicBool,
    }

    impl StopProbe {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                hit: AtomicBool::new(false),
            })
        }
    }

    impl AppLifetime for StopProbe {
        fn request_stop(&self) {
            self.hit.store(true, Ordering::SeqCst);
        }
    }

    // ---- helper: poll a condition until a deadline
    fn wait_until(dur: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        loop {
            if cond() {
                return true;
            }
            if start.elapsed() > dur {
                return false;
            }
            thread::sleep(Duration::from_millis(2));
        }
    }

    fn started_loop() -> LoopThread {
        let mut lt = LoopThread::new(LoopConfig::default()).expect("loop construction failed");
        lt.start().expect("loop start failed");
        lt
    }

    fn attached_pair(lt: &LoopThread) -> (Arc<Connection>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind failed");
        let addr = listener.local_addr().expect("local_addr failed");
        let client = TcpStream::connect(addr).expect("connect failed");
        let (server, _) = listener.accept().expect("accept failed");
        let conn = Connection::attach(lt, server).expect("attach failed");
        (conn, client)
    }

    #[test]
    fn cold_stop_resolves_immediately() {
        let mut lt = LoopThread::new(LoopConfig::default()).expect("loop construction failed");

        let start = Instant::now();
        lt.stop(Duration::from_secs(60)).expect("cold stop failed");
        assert!(start.elapsed() < Duration::from_millis(200));
        assert!(lt.fatal_error().is_none());
    }

    #[test]
    fn start_then_stop_captures_no_error() {
        let mut lt = started_loop();
        lt.stop(Duration::from_secs(3)).expect("stop failed");
        assert!(lt.fatal_error().is_none());
    }

    #[test]
    fn clean_shutdown_resolves_all_completions() {
        let mut lt = started_loop();
        let handle = lt.handle();

        let waiters: Vec<_> = (0..10)
            .map(|_| handle.post_waitable(|_| Ok(())).expect("post failed"))
            .collect();
        for w in &waiters {
            w.wait(Some(Duration::from_secs(2))).expect("completion failed");
        }

        let start = Instant::now();
        lt.stop(Duration::from_secs(3)).expect("stop failed");
        // nothing referenced the loop, so the first phase must succeed
        assert!(start.elapsed() < Duration::from_millis(900));
        assert!(lt.fatal_error().is_none());
    }

    #[test]
    fn fatal_work_item_is_rethrown_from_stop() {
        let probe = StopProbe::new();
        let mut lt = LoopThread::with_lifetime(LoopConfig::default(), probe.clone())
            .expect("loop construction failed");
        lt.start().expect("loop start failed");

        lt.handle()
            .post(|_| Err(anyhow::anyhow!("boom")))
            .expect("post failed");

        assert!(wait_until(Duration::from_secs(2), || {
            lt.handle().is_disposed()
        }));

        let err = lt.stop(Duration::from_secs(3)).expect_err("stop must rethrow");
        assert!(format!("{err:#}").contains("boom"));
        assert!(lt.fatal_error().is_some());
        assert!(probe.hit.load(Ordering::SeqCst));
    }

    #[test]
    fn rude_shutdown_disposes_lingering_handles() {
        let mut lt = started_loop();

        lt.handle()
            .post_waitable(|ctx| {
                ctx.register_keep_alive();
                Ok(())
            })
            .expect("post failed")
            .wait(Some(Duration::from_secs(2)))
            .expect("keep-alive registration failed");

        let start = Instant::now();
        lt.stop(Duration::from_secs(3)).expect("stop failed");
        let elapsed = start.elapsed();

        // the first phase must time out at one step, the second succeeds
        assert!(elapsed >= Duration::from_millis(900), "elapsed: {elapsed:?}");
        assert!(elapsed < Duration::from_millis(2500), "elapsed: {elapsed:?}");
        assert!(lt.fatal_error().is_none());
    }

    #[test]
    fn double_unreference_is_noop() {
        let mut lt = started_loop();

        lt.handle()
            .post(|ctx| {
                ctx.unreference_waker();
                ctx.unreference_waker();
                Ok(())
            })
            .expect("post failed");

        assert!(wait_until(Duration::from_secs(2), || {
            lt.handle().is_disposed()
        }));
        lt.stop(Duration::from_secs(3)).expect("stop failed");
        assert!(lt.fatal_error().is_none());
    }

    #[test]
    fn concurrent_posts_deliver_exactly_once() {
        let mut lt = started_loop();
        let handle = lt.handle();
        let count = Arc::new(AtomicUsize::new(0));

        let producers: Vec<_> = (0..4)
            .map(|_| {
                let handle = handle.clone();
                let count = count.clone();
                thread::spawn(move || {
                    for _ in 0..250 {
                        let count = count.clone();
                        handle
                            .post(move |_| {
                                count.fetch_add(1, Ordering::Relaxed);
                                Ok(())
                            })
                            .expect("post failed");
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().expect("producer panicked");
        }

        assert!(wait_until(Duration::from_secs(2), || {
            count.load(Ordering::Relaxed) == 1000
        }));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::Relaxed), 1000);

        lt.stop(Duration::from_secs(3)).expect("stop failed");
    }

    #[test]
    fn close_enqueued_during_close_drain_still_runs() {
        let mut lt = started_loop();
        let count = Arc::new(AtomicUsize::new(0));

        let inner = count.clone();
        let outer = count.clone();
        lt.handle()
            .queue_close(move |ctx| {
                outer.fetch_add(1, Ordering::SeqCst);
                ctx.defer_close(move |_| {
                    inner.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                });
                Ok(())
            })
            .expect("queue_close failed");

        assert!(wait_until(Duration::from_secs(2), || {
            count.load(Ordering::SeqCst) == 2
        }));
        lt.stop(Duration::from_secs(3)).expect("stop failed");
    }

    #[test]
    fn write_burst_arrives_in_order() {
        let mut lt = started_loop();
        let (conn, mut client) = attached_pair(&lt);

        let payload: Vec<u8> = (0..16 * 1024).map(|i| (i % 251) as u8).collect();

        let reader = thread::spawn(move || {
            let mut got = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                match client.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => got.extend_from_slice(&buf[..n]),
                    Err(_) => break,
                }
            }
            got
        });

        conn.write(&payload).expect("write failed");
        conn.close_output();

        let got = reader.join().expect("reader panicked");
        assert_eq!(got, payload);

        assert!(wait_until(Duration::from_secs(2), || {
            lt.connections().is_empty()
        }));

        // one pump, sequential writes: exactly one pooled request remains
        let pooled = Arc::new(AtomicUsize::new(usize::MAX));
        let probe = pooled.clone();
        lt.handle()
            .post_waitable(move |ctx| {
                probe.store(ctx.write_pool.len(), Ordering::SeqCst);
                Ok(())
            })
            .expect("post failed")
            .wait(Some(Duration::from_secs(2)))
            .expect("probe failed");
        assert_eq!(pooled.load(Ordering::SeqCst), 1);

        lt.stop(Duration::from_secs(3)).expect("stop failed");
        assert!(lt.fatal_error().is_none());
    }

    #[test]
    fn cancel_during_write_half_closes_and_notifies_once() {
        let mut lt = started_loop();
        let (conn, mut client) = attached_pair(&lt);

        // enough to overrun the socket buffers and leave a write in flight
        let payload: Vec<u8> = (0..1024 * 1024).map(|i| (i % 249) as u8).collect();
        conn.write(&payload).expect("write failed");

        thread::sleep(Duration::from_millis(50));
        conn.cancel_output();

        // draining the peer lets the in-flight write settle; the pump then
        // observes the cancel, sends FIN, and closes the socket
        let reader = thread::spawn(move || {
            let mut total = 0usize;
            let mut buf = [0u8; 16 * 1024];
            loop {
                match client.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => total += n,
                    Err(_) => break,
                }
            }
            total
        });

        let received = reader.join().expect("reader panicked");
        assert!(received <= payload.len());

        assert!(wait_until(Duration::from_secs(5), || {
            lt.connections().is_empty()
        }));
        assert!(wait_until(Duration::from_secs(2), || {
            conn.is_socket_closed()
        }));

        lt.stop(Duration::from_secs(3)).expect("stop failed");
        assert!(lt.fatal_error().is_none());
    }

    #[test]
    fn abort_disposes_socket_and_cleanup_runs() {
        let mut lt = started_loop();
        let (conn, mut client) = attached_pair(&lt);

        conn.write(b"partial").expect("write failed");
        conn.abort();

        assert!(wait_until(Duration::from_secs(2), || {
            conn.is_socket_closed()
        }));
        assert!(wait_until(Duration::from_secs(2), || {
            lt.connections().is_empty()
        }));

        // the peer observes the connection ending one way or another
        let mut buf = [0u8; 1024];
        let _ = client.read(&mut buf);

        lt.stop(Duration::from_secs(3)).expect("stop failed");
    }

    #[test]
    fn post_after_stop_reports_disposed() {
        let mut lt = started_loop();
        let handle = lt.handle();
        lt.stop(Duration::from_secs(3)).expect("stop failed");

        assert!(handle.post(|_| Ok(())).is_err());
        assert!(handle.is_disposed());
    }
}
