//! One activation run, from reading the device to applying the record
//!
//! The [`Activator`] owns the device channel for the whole run. Every entry
//! point consumes it, so the channel is dropped, and the device released,
//! whether the run succeeds or fails.

use tracing::info;

use crate::{
    IdeviceError,
    activation_info::ActivationInfo,
    cache::{self, CacheStore},
    device::DeviceChannel,
    identity::{IdentityResolver, Overrides},
    request::ActivationRequest,
    ticket,
    transport::ActivationTransport,
};

pub struct Activator<D, T> {
    device: D,
    transport: T,
    cache: CacheStore,
    overrides: Overrides,
}

impl<D: DeviceChannel, T: ActivationTransport> Activator<D, T> {
    pub fn new(device: D, transport: T, cache: CacheStore) -> Self {
        Self {
            device,
            transport,
            cache,
            overrides: Overrides::default(),
        }
    }

    /// Identifier values to use instead of the device's or the cache's
    pub fn with_overrides(mut self, overrides: Overrides) -> Self {
        self.overrides = overrides;
        self
    }

    /// Asks the activation server for a record without applying it
    ///
    /// Runs the cache check, resolves the identity, builds and posts the
    /// request, then pulls the record out of the response. Nothing reaches
    /// the network if the replay cache belongs to another device.
    pub async fn fetch_record(&mut self) -> Result<plist::Value, IdeviceError> {
        cache::check_device(&self.cache, &mut self.device).await?;

        let identity = IdentityResolver::new(&self.cache)
            .resolve(&mut self.device, &self.overrides)
            .await?;
        info!("Activating {} {}", identity.device_class, identity.uuid);

        let activation_info = ActivationInfo::fetch(&mut self.device).await?;
        let request = ActivationRequest::build(&identity, &activation_info, &self.cache).await?;

        let body = self.transport.post(&request).await?;
        ticket::parse_response(&body)
    }

    /// Activates the device with a fresh record from the activation server
    ///
    /// # Returns
    /// The record the device accepted
    pub async fn activate(mut self) -> Result<plist::Value, IdeviceError> {
        let record = self.fetch_record().await?;
        self.device.activate(record.clone()).await?;
        info!("Activation record applied");
        Ok(record)
    }

    /// Applies a record obtained earlier, without contacting the server
    pub async fn activate_with_record(mut self, record: plist::Value) -> Result<(), IdeviceError> {
        self.device.activate(record).await
    }

    pub async fn deactivate(mut self) -> Result<(), IdeviceError> {
        self.device.deactivate().await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::{
        cache::{CacheConfig, entry},
        device::mock::MockDevice,
        transport::mock::MockTransport,
    };

    const TICKET: &str = "<html><script>\
        <plist version=\"1.0\"><dict><key>device-activation</key><dict>\
        <key>activation-record</key><dict><key>ticket</key><string>T1</string></dict>\
        </dict></dict></plist></script></html>";

    fn t1() -> plist::Value {
        let mut record = plist::Dictionary::new();
        record.insert("ticket".into(), "T1".into());
        plist::Value::Dictionary(record)
    }

    #[tokio::test]
    async fn iphone_end_to_end() {
        let mut activator = Activator::new(
            MockDevice::iphone(),
            MockTransport::new(TICKET),
            CacheStore::disabled(),
        );

        let record = activator.fetch_record().await.unwrap();
        assert_eq!(record, t1());

        let requests = activator.transport.requests.lock().unwrap().clone();
        assert_eq!(requests.len(), 1);
        let names: Vec<&str> = requests[0].fields().iter().map(|(k, _)| *k).collect();
        assert_eq!(
            names,
            [
                "machineName",
                "InStoreActivation",
                "IMEI",
                "IMSI",
                "ICCID",
                "AppleSerialNumber",
                "activation-info"
            ]
        );
        assert_eq!(requests[0].field("IMEI"), Some("123456789012345"));

        activator.device.activate(record).await.unwrap();
        assert_eq!(activator.device.applied, Some(t1()));
    }

    #[tokio::test]
    async fn activate_applies_the_record() {
        let device = MockDevice::iphone();
        let released = device.released.clone();

        let record = Activator::new(device, MockTransport::new(TICKET), CacheStore::disabled())
            .activate()
            .await
            .unwrap();
        assert_eq!(record, t1());
        assert!(released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn overrides_reach_the_request() {
        let mut activator = Activator::new(
            MockDevice::iphone(),
            MockTransport::new(TICKET),
            CacheStore::disabled(),
        )
        .with_overrides(Overrides {
            imsi: Some("001010000000001".into()),
            ..Default::default()
        });

        activator.fetch_record().await.unwrap();
        let requests = activator.transport.requests.lock().unwrap();
        assert_eq!(requests[0].field("IMSI"), Some("001010000000001"));
        assert!(!activator.device.was_queried(crate::device::IMSI));
    }

    #[tokio::test]
    async fn uuid_mismatch_never_reaches_the_network() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(entry::UUID), "some-other-device").unwrap();
        let cache = CacheStore::new(CacheConfig::replay(dir.path())).unwrap();

        let mut activator =
            Activator::new(MockDevice::iphone(), MockTransport::new(TICKET), cache);
        assert!(matches!(
            activator.fetch_record().await,
            Err(IdeviceError::CacheMismatch { .. })
        ));
        assert_eq!(activator.transport.calls(), 0);
    }

    #[tokio::test]
    async fn replay_uses_the_cached_sim_identifiers() {
        let dir = tempfile::tempdir().unwrap();
        let backup = Activator::new(
            MockDevice::iphone(),
            MockTransport::new(TICKET),
            CacheStore::new(CacheConfig::backup(dir.path())).unwrap(),
        );
        backup.activate().await.unwrap();

        // same device, SIM pulled
        let mut device = MockDevice::iphone();
        device.values.remove(crate::device::IMSI);
        device.values.remove(crate::device::ICCID);
        let mut replay = Activator::new(
            device,
            MockTransport::new(TICKET),
            CacheStore::new(CacheConfig::replay(dir.path())).unwrap(),
        );
        replay.fetch_record().await.unwrap();

        let requests = replay.transport.requests.lock().unwrap();
        assert_eq!(requests[0].field("IMSI"), Some("310150123456789"));
        assert_eq!(requests[0].field("ICCID"), Some("8901260123456789012"));
    }

    #[tokio::test]
    async fn device_is_released_after_a_failed_run() {
        let device = MockDevice::iphone();
        let released = device.released.clone();

        let res = Activator::new(device, MockTransport::new("no ticket"), CacheStore::disabled())
            .activate()
            .await;
        assert!(matches!(res, Err(IdeviceError::MalformedResponse(_))));
        assert!(released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn local_record_is_applied_as_is() {
        let device = MockDevice::iphone();
        let released = device.released.clone();

        Activator::new(device, MockTransport::new(""), CacheStore::disabled())
            .activate_with_record(t1())
            .await
            .unwrap();
        assert!(released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn deactivation_releases_the_device() {
        let device = MockDevice::iphone();
        let released = device.released.clone();

        Activator::new(device, MockTransport::new(""), CacheStore::disabled())
            .deactivate()
            .await
            .unwrap();
        assert!(released.load(Ordering::SeqCst));
    }
}
