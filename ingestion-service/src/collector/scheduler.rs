use std::{sync::Arc, time::Duration};

use super::{
    session::{fan_out, Action, DeviceOutcome, Step},
    ParameterCatalog, Roster,
};
use crate::s7::DeviceConnector;

/// Fans device work out over a bounded pool, one session per endpoint.
///
/// Every parameter of every unit behind an endpoint is handled sequentially
/// on a single session; endpoints run concurrently up to `workers`. Failures
/// of any kind come back as unsuccessful outcomes, never as an `Err`.
pub struct DeviceScheduler<C> {
    pub(crate) connector: Arc<C>,
    pub(crate) workers: usize,
    pub(crate) session_timeout: Duration,
}

impl<C> DeviceScheduler<C>
where
    C: DeviceConnector + 'static,
{
    pub fn new(connector: C, workers: usize, session_timeout: Duration) -> Self {
        Self {
            connector: Arc::new(connector),
            workers: workers.max(1),
            session_timeout,
        }
    }

    /// Read the whole catalog for every roster unit. Output order is
    /// unspecified across endpoints.
    pub async fn collect(&self, roster: &Roster, catalog: &ParameterCatalog) -> Vec<DeviceOutcome> {
        let plan: Vec<Step> = catalog
            .iter()
            .map(|(key, spec)| Step {
                parameter: key.to_string(),
                action: Action::Read(spec.clone()),
            })
            .collect();
        tracing::info!(
            units = roster.len(),
            parameters = plan.len(),
            "starting device collection"
        );

        let outcomes = fan_out(
            self.connector.clone(),
            roster,
            Arc::new(plan),
            self.workers,
            self.session_timeout,
        )
        .await;

        let ok = outcomes.iter().filter(|o| o.success).count();
        tracing::info!(ok, failed = outcomes.len() - ok, "device collection finished");
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Mutex,
        },
    };

    use bytes::Bytes;

    use super::*;
    use crate::collector::session::SESSION_TIMED_OUT;
    use crate::s7::{check_range, DeviceAddress, DeviceSession, ProtocolError, Scalar};

    /// Scripted devices keyed by IP. Missing IPs refuse connections and
    /// `hang` IPs never answer.
    #[derive(Default)]
    struct FakeConnector {
        images: HashMap<String, Vec<u8>>,
        hang: Vec<String>,
        connects: AtomicUsize,
        disconnects: Arc<AtomicUsize>,
        in_flight: Arc<AtomicUsize>,
        peak: Arc<Mutex<usize>>,
    }

    struct FakeSession {
        image: Vec<u8>,
        disconnects: Arc<AtomicUsize>,
        in_flight: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl DeviceConnector for FakeConnector {
        type Session = FakeSession;

        async fn connect(&self, address: &DeviceAddress) -> Result<FakeSession, ProtocolError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.hang.contains(&address.ip) {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            let image = self.images.get(&address.ip).cloned().ok_or_else(|| ProtocolError::Connect {
                address: address.ip.clone(),
                reason: "connection refused".into(),
            })?;

            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            {
                let mut peak = self.peak.lock().unwrap();
                *peak = (*peak).max(now);
            }
            Ok(FakeSession {
                image,
                disconnects: self.disconnects.clone(),
                in_flight: self.in_flight.clone(),
            })
        }
    }

    #[async_trait::async_trait]
    impl DeviceSession for FakeSession {
        async fn read(&mut self, _block: u16, offset: u32, length: u32) -> Result<Bytes, ProtocolError> {
            check_range(offset, length)?;
            tokio::time::sleep(Duration::from_millis(5)).await;
            let start = offset as usize;
            self.image
                .get(start..start + length as usize)
                .map(Bytes::copy_from_slice)
                .ok_or_else(|| ProtocolError::Read("address past end of block".into()))
        }

        async fn write(&mut self, _block: u16, offset: u32, data: &[u8]) -> Result<(), ProtocolError> {
            check_range(offset, data.len() as u32)?;
            let start = offset as usize;
            match self.image.get_mut(start..start + data.len()) {
                Some(slot) => {
                    slot.copy_from_slice(data);
                    Ok(())
                }
                None => Err(ProtocolError::Write("address past end of block".into())),
            }
        }

        async fn disconnect(&mut self) {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn image(counter: u32) -> Vec<u8> {
        let mut image = vec![0u8; 32];
        image[4..8].copy_from_slice(&counter.to_be_bytes());
        image
    }

    fn catalog() -> ParameterCatalog {
        ParameterCatalog::from_json(
            r#"{
                "total_hot_quantity": {"db_num": 1, "offset": 4, "length": 4, "data_type": "uint32"},
                "bad_param": {"db_num": 1, "offset": 65534, "length": 4, "data_type": "uint32"}
            }"#,
        )
        .unwrap()
    }

    fn roster(pairs: &[(&str, &str)]) -> Roster {
        let doc: serde_json::Map<String, serde_json::Value> = pairs
            .iter()
            .map(|(unit, ip)| (unit.to_string(), serde_json::json!({ "PLC IP地址": ip })))
            .collect();
        Roster::from_json(&serde_json::Value::Object(doc).to_string()).unwrap()
    }

    #[tokio::test]
    async fn units_sharing_an_endpoint_share_one_session() {
        let connector = FakeConnector {
            images: HashMap::from([("10.0.0.1".to_string(), image(10_100))]),
            ..Default::default()
        };
        let disconnects = connector.disconnects.clone();
        let scheduler = DeviceScheduler::new(connector, 4, Duration::from_secs(5));

        let outcomes = scheduler
            .collect(&roster(&[("9-1-3104", "10.0.0.1"), ("9-1-3105", "10.0.0.1")]), &catalog())
            .await;

        assert_eq!(outcomes.len(), 4);
        assert_eq!(scheduler.connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);

        let hot: Vec<_> = outcomes.iter().filter(|o| o.parameter == "total_hot_quantity").collect();
        assert!(hot.iter().all(|o| o.success && o.value == Some(Scalar::Int(10_100))));
        // A failing parameter does not abort its siblings on the same session.
        let bad: Vec<_> = outcomes.iter().filter(|o| o.parameter == "bad_param").collect();
        assert!(bad.iter().all(|o| !o.success && o.message.contains("out of bounds")));
    }

    #[tokio::test]
    async fn connect_failure_fails_every_parameter_of_that_endpoint_only() {
        let connector = FakeConnector {
            images: HashMap::from([("10.0.0.1".to_string(), image(1))]),
            ..Default::default()
        };
        let scheduler = DeviceScheduler::new(connector, 2, Duration::from_secs(5));

        let outcomes = scheduler
            .collect(
                &roster(&[("9-1-3104", "10.0.0.1"), ("9-1-3201", "10.0.0.2"), ("9-1-3202", "10.0.0.2")]),
                &catalog(),
            )
            .await;

        let dead: Vec<_> = outcomes.iter().filter(|o| o.address == "10.0.0.2").collect();
        assert_eq!(dead.len(), 4);
        assert!(dead.iter().all(|o| !o.success && o.message.contains("connection refused")));
        assert!(outcomes
            .iter()
            .any(|o| o.address == "10.0.0.1" && o.success));
    }

    #[tokio::test]
    async fn overrunning_session_becomes_a_uniform_failure() {
        let connector = FakeConnector {
            images: HashMap::from([
                ("10.0.0.1".to_string(), image(1)),
                ("10.0.0.9".to_string(), image(2)),
            ]),
            hang: vec!["10.0.0.9".to_string()],
            ..Default::default()
        };
        let scheduler = DeviceScheduler::new(connector, 2, Duration::from_millis(200));

        let outcomes = scheduler
            .collect(&roster(&[("9-1-3104", "10.0.0.1"), ("9-1-3999", "10.0.0.9")]), &catalog())
            .await;

        let hung: Vec<_> = outcomes.iter().filter(|o| o.address == "10.0.0.9").collect();
        assert_eq!(hung.len(), 2);
        assert!(hung.iter().all(|o| o.message == SESSION_TIMED_OUT));
    }

    #[tokio::test]
    async fn session_past_its_deadline_is_still_disconnected() {
        let connector = FakeConnector {
            images: HashMap::from([("10.0.0.1".to_string(), image(1))]),
            ..Default::default()
        };
        let disconnects = connector.disconnects.clone();
        let in_flight = connector.in_flight.clone();
        // Each read takes 5 ms, so the second parameter starts past the deadline.
        let scheduler = DeviceScheduler::new(connector, 1, Duration::from_millis(3));

        let outcomes = scheduler
            .collect(&roster(&[("9-1-3104", "10.0.0.1")]), &catalog())
            .await;

        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| !o.success && o.message == SESSION_TIMED_OUT));
        assert_eq!(scheduler.connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn worker_pool_bounds_open_sessions() {
        let ips: Vec<String> = (1..=8).map(|i| format!("10.0.1.{i}")).collect();
        let connector = FakeConnector {
            images: ips.iter().map(|ip| (ip.clone(), image(7))).collect(),
            ..Default::default()
        };
        let peak = connector.peak.clone();
        let scheduler = DeviceScheduler::new(connector, 3, Duration::from_secs(5));

        let units: Vec<(String, String)> = ips.iter().enumerate().map(|(i, ip)| (format!("1-1-{i}"), ip.clone())).collect();
        let pairs: Vec<(&str, &str)> = units.iter().map(|(u, ip)| (u.as_str(), ip.as_str())).collect();
        let outcomes = scheduler.collect(&roster(&pairs), &catalog()).await;

        assert_eq!(outcomes.len(), 16);
        assert!(*peak.lock().unwrap() <= 3);
    }
}
