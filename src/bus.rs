//! Delivery of worker events to the single owning (UI) thread.
//!
//! Any thread may hold a [`BusSender`] and post messages; only the thread that
//! created the [`UiBus`] can consume them. `UiBus` is `!Send`, so handing the
//! receiving end to another thread is a compile error rather than a runtime
//! surprise.

use std::marker::PhantomData;

/// Create a bus. Keep the `UiBus` on the owning thread, clone the sender freely.
pub fn channel<M>() -> (BusSender<M>, UiBus<M>) {
    let (tx, rx) = async_channel::unbounded();
    (
        BusSender { tx },
        UiBus {
            rx,
            _not_send: PhantomData,
        },
    )
}

/// Posting end. Never blocks and never drops a message while the bus is alive.
#[derive(Debug)]
pub struct BusSender<M> {
    tx: async_channel::Sender<M>,
}

impl<M> Clone for BusSender<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<M> BusSender<M> {
    /// Queue `msg` for execution on the owning thread.
    ///
    /// The channel is unbounded, so this only fails once the consuming side is
    /// gone, at which point there is nobody left to run the message.
    pub fn post(&self, msg: M) {
        if self.tx.try_send(msg).is_err() {
            log::debug!("UI bus closed, message discarded");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consuming end, pinned to the thread that created it.
#[derive(Debug)]
pub struct UiBus<M> {
    rx: async_channel::Receiver<M>,
    _not_send: PhantomData<*const ()>,
}

impl<M> UiBus<M> {
    /// Next message, if one is queued.
    pub fn try_next(&self) -> Option<M> {
        self.rx.try_recv().ok()
    }

    /// Wait for the next message. For use from a local (non-`Send`) executor
    /// such as the GTK main loop.
    pub async fn next(&self) -> Option<M> {
        self.rx.recv().await.ok()
    }

    /// Block the owning thread until a message arrives.
    pub fn next_blocking(&self) -> Option<M> {
        self.rx.recv_blocking().ok()
    }

    /// Run `handler` on every message queued right now. Returns how many ran.
    pub fn drain(&self, mut handler: impl FnMut(M)) -> usize {
        let mut n = 0;
        while let Ok(msg) = self.rx.try_recv() {
            handler(msg);
            n += 1;
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivers_each_message_once_in_post_order() {
        let (tx, bus) = channel::<u32>();
        for i in 0..5 {
            tx.post(i);
        }
        let mut seen = Vec::new();
        assert_eq!(bus.drain(|m| seen.push(m)), 5);
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert!(bus.try_next().is_none());
    }

    #[test]
    fn per_thread_fifo_with_many_producers() {
        let (tx, bus) = channel::<(usize, usize)>();
        let producers: Vec<_> = (0..4)
            .map(|t| {
                let tx = tx.clone();
                std::thread::spawn(move || {
                    for i in 0..500 {
                        tx.post((t, i));
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }

        let mut next_expected = [0usize; 4];
        let mut total = 0;
        bus.drain(|(t, i)| {
            assert_eq!(i, next_expected[t], "thread {t} delivered out of order");
            next_expected[t] += 1;
            total += 1;
        });
        assert_eq!(total, 2000);
        assert_eq!(next_expected, [500; 4]);
    }

    #[test]
    fn post_after_consumer_dropped_does_not_panic() {
        let (tx, bus) = channel::<&'static str>();
        drop(bus);
        assert!(tx.is_closed());
        tx.post("late");
    }

    #[test]
    fn blocking_receive_waits_for_worker() {
        let (tx, bus) = channel::<&'static str>();
        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            tx.post("done");
        });
        assert_eq!(bus.next_blocking(), Some("done"));
        assert_eq!(bus.next_blocking(), None);
    }
}
