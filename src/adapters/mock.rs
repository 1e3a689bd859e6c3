//! Mock platform adapter
//!
//! Simulates delivery receipts: every probe gets a receipt after a random
//! delay, except for a configurable fraction that is dropped to exercise
//! the timeout path.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::{sleep, Duration};
use uuid::Uuid;

use crate::adapters::{Adapter, AdapterProbe, AdapterReceipt};
use crate::models::{now_ms, PRIMARY_DEVICE};

pub struct MockAdapter {
    min_delay_ms: u64,
    max_delay_ms: u64,
    drop_rate: f64,
    device_id: String,
    tx: mpsc::Sender<AdapterReceipt>,
    rx: Mutex<Option<mpsc::Receiver<AdapterReceipt>>>,
    simulations: Mutex<JoinSet<()>>,
    closed: AtomicBool,
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new(80, 800, 0.05)
    }
}

impl MockAdapter {
    pub fn new(min_delay_ms: u64, max_delay_ms: u64, drop_rate: f64) -> Self {
        let (tx, rx) = mpsc::channel(1024);
        Self {
            min_delay_ms,
            max_delay_ms,
            drop_rate,
            device_id: PRIMARY_DEVICE.to_string(),
            tx,
            rx: Mutex::new(Some(rx)),
            simulations: Mutex::new(JoinSet::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// A mock that answers every probe, fast. Handy in tests.
    pub fn reliable(delay_ms: u64) -> Self {
        Self::new(delay_ms, delay_ms, 0.0)
    }
}

#[async_trait]
impl Adapter for MockAdapter {
    async fn send_probe(&self) -> Result<AdapterProbe> {
        let probe_id = Uuid::new_v4().simple().to_string();
        let sent_at_ms = now_ms();

        let (dropped, delay_ms) = {
            let mut rng = rand::thread_rng();
            let dropped = rng.gen::<f64>() < self.drop_rate;
            let delay_ms = rng.gen_range(self.min_delay_ms..=self.max_delay_ms);
            (dropped, delay_ms)
        };

        if !dropped {
            let tx = self.tx.clone();
            let device_id = self.device_id.clone();
            let probe = probe_id.clone();
            self.simulations.lock().spawn(async move {
                sleep(Duration::from_millis(delay_ms)).await;
                let _ = tx
                    .send(AdapterReceipt {
                        probe_id: probe,
                        device_id,
                        received_at_ms: now_ms(),
                        status: "delivered".to_string(),
                        platform_message_id: None,
                    })
                    .await;
            });
        }

        Ok(AdapterProbe {
            probe_id,
            sent_at_ms,
            platform_message_id: None,
            platform_message_ts: None,
            send_response: None,
        })
    }

    async fn receipts(&self) -> Result<mpsc::Receiver<AdapterReceipt>> {
        match self.rx.lock().take() {
            Some(rx) => Ok(rx),
            None => bail!("mock receipt stream already taken"),
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.simulations.lock().abort_all();
    }
}
