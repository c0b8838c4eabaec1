use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;
use tokio::time::{Duration, sleep};

use super::TelematicsChannel;
use crate::vehicle::OnBoardUnit;

/// Routes telematics traffic to registered on-board units, with a small
/// simulated link latency.
pub struct SimulatedTelematics {
    units: Arc<RwLock<HashMap<String, Arc<OnBoardUnit>>>>,
    latency: Duration,
    message_counter: Arc<AtomicUsize>,
}

impl Default for SimulatedTelematics {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

impl SimulatedTelematics {
    pub fn new(latency: Duration) -> Self {
        Self {
            units: Arc::new(RwLock::new(HashMap::new())),
            latency,
            message_counter: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub async fn register_unit(&self, unit: Arc<OnBoardUnit>) {
        self.units.write().await.insert(unit.vin.clone(), unit);
    }

    pub async fn unit(&self, vin: &str) -> Option<Arc<OnBoardUnit>> {
        self.units.read().await.get(vin).cloned()
    }

    pub fn get_message_count(&self) -> usize {
        self.message_counter.load(Ordering::Relaxed)
    }

    async fn route(&self, vin: &str) -> Result<Arc<OnBoardUnit>, String> {
        self.message_counter.fetch_add(1, Ordering::Relaxed);
        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }
        self.unit(vin)
            .await
            .ok_or_else(|| format!("vehicle {} is not reachable", vin))
    }
}

#[async_trait]
impl TelematicsChannel for SimulatedTelematics {
    async fn send_command(&self, vin: &str, command: &str, key_id: &str) -> Result<(), String> {
        self.route(vin).await?.execute(command, key_id).await
    }

    async fn provision_verifier(
        &self,
        vin: &str,
        verifier: &str,
        session_id: &str,
    ) -> Result<(), String> {
        self.route(vin)
            .await?
            .store_verifier(session_id, verifier)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn routes_to_registered_unit() {
        let telematics = SimulatedTelematics::default();
        let unit = Arc::new(OnBoardUnit::new("1HGCM82633A004352"));
        telematics.register_unit(unit.clone()).await;

        telematics
            .send_command("1HGCM82633A004352", "TERMINATE", "KEY-0000000001")
            .await
            .unwrap();
        assert_eq!(unit.received_commands().await[0].command, "TERMINATE");
        assert!(
            telematics
                .send_command("5YJSA1E26HF000001", "TERMINATE", "KEY-0000000001")
                .await
                .is_err()
        );
        assert_eq!(telematics.get_message_count(), 2);
    }
}
