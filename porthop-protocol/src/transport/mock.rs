//! In-memory transports for tests.

use std::collections::VecDeque;
use std::io;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::Notify;

use super::TunTransport;

/// An in-memory TUN: tests inject frames to be "read" by the engine and
/// inspect the frames the engine wrote.
pub struct MockTun {
    mtu: usize,
    inbound: Mutex<VecDeque<Vec<u8>>>,
    inbound_ready: Notify,
    written: Mutex<Vec<Vec<u8>>>,
    written_ready: Notify,
}

impl MockTun {
    pub fn new(mtu: usize) -> MockTun {
        MockTun {
            mtu,
            inbound: Mutex::new(VecDeque::new()),
            inbound_ready: Notify::new(),
            written: Mutex::new(Vec::new()),
            written_ready: Notify::new(),
        }
    }

    /// Queues a frame for the engine to read.
    pub fn inject(&self, frame: Vec<u8>) {
        self.inbound
            .lock()
            .expect("mock tun inbound lock")
            .push_back(frame);
        self.inbound_ready.notify_one();
    }

    /// Frames the engine has written so far.
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.written.lock().expect("mock tun written lock").clone()
    }

    /// Waits until at least `n` frames were written.
    pub async fn wait_written(&self, n: usize) -> Vec<Vec<u8>> {
        loop {
            let notified = self.written_ready.notified();
            {
                let w = self.written.lock().expect("mock tun written lock");
                if w.len() >= n {
                    return w.clone();
                }
            }
            notified.await;
        }
    }
}

#[async_trait]
impl TunTransport for MockTun {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let notified = self.inbound_ready.notified();
            {
                let mut q = self.inbound.lock().expect("mock tun inbound lock");
                if let Some(frame) = q.pop_front() {
                    let n = frame.len().min(buf.len());
                    buf[..n].copy_from_slice(&frame[..n]);
                    return Ok(n);
                }
            }
            notified.await;
        }
    }

    async fn send(&self, frame: &[u8]) -> io::Result<()> {
        self.written
            .lock()
            .expect("mock tun written lock")
            .push(frame.to_vec());
        self.written_ready.notify_waiters();
        Ok(())
    }

    fn mtu(&self) -> usize {
        self.mtu
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn inject_then_recv() {
        let tun = MockTun::new(1400);
        tun.inject(vec![1, 2, 3]);
        let mut buf = [0u8; 16];
        let n = tun.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3]);
    }

    #[tokio::test]
    async fn send_is_captured() {
        let tun = MockTun::new(1400);
        tun.send(&[9, 9]).await.unwrap();
        assert_eq!(tun.wait_written(1).await, vec![vec![9, 9]]);
    }
}
