//! Signing through the router: outbound signing to the vehicle and inbound
//! validation of signed frames.

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use mavbridge_router::router::{CLOUD, INJECTOR, MIRROR, VEHICLE};
    use mavbridge_router::{
        Frame, InjectionConfig, Router, RouterConfig, SensorMessage, SerialHost, Signer,
        SigningConfig, SigningKey,
    };

    use crate::harness::*;

    const KEY: [u8; 32] = [0x42; 32];

    fn signing(reject_invalid: bool) -> SigningConfig {
        SigningConfig {
            key_hex: "42".repeat(32),
            link_id: 7,
            reject_invalid,
        }
    }

    fn ground_signer() -> Signer {
        Signer::new(SigningKey::from_bytes(KEY), 1)
    }

    fn tampered(frame: &Frame) -> Frame {
        let mut raw = frame.raw().to_vec();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        Frame::from_bytes(&raw).unwrap()
    }

    fn start(
        host: &Arc<MockSerialHost>,
        relay: &CloudRelay,
        extra: RouterConfig,
    ) -> Router {
        init_tracing();
        let serial: Arc<dyn SerialHost> = host.clone();
        let router = Router::new(Some(serial));
        router
            .start(RouterConfig {
                vehicle: Some(serial_config()),
                cloud: Some(relay.config()),
                ..extra
            })
            .unwrap();
        router
    }

    #[tokio::test]
    async fn test_downlink_is_signed_for_vehicle() {
        let host = MockSerialHost::ready();
        let relay = CloudRelay::bind().await.unwrap();
        let mirror = MirrorListener::bind().await.unwrap();
        let router = start(
            &host,
            &relay,
            RouterConfig {
                mirror: Some(mirror.config()),
                signing: Some(signing(true)),
                ..fast_config()
            },
        );

        let mut cloud = relay.accept().await.unwrap();
        let mut vehicle = host.next_link().await.unwrap();
        assert!(wait_connected(&router, &[VEHICLE, CLOUD, MIRROR]).await);

        let command = command_long(4, 511);
        cloud.send(&command).await.unwrap();

        let delivered = vehicle.recv(WAIT).await.unwrap();
        assert!(delivered.is_signed());
        assert_eq!(delivered.len(), command.len() + 13);
        assert_eq!(delivered.message_id(), 76);
        assert_eq!(delivered.signature().unwrap()[0], 7);
        assert!(ground_signer().validate(&delivered));

        assert_eq!(mirror.recv(WAIT).await, Some(command));
        assert!(eventually(|| router.stats().downlink_frames == 1).await);
        assert_eq!(router.stats().signature_failures, 0);

        router.stop().await;
    }

    #[tokio::test]
    async fn test_invalid_uplink_signature_is_rejected() {
        let host = MockSerialHost::ready();
        let relay = CloudRelay::bind().await.unwrap();
        let router = start(
            &host,
            &relay,
            RouterConfig {
                signing: Some(signing(true)),
                ..fast_config()
            },
        );

        let mut cloud = relay.accept().await.unwrap();
        let mut vehicle = host.next_link().await.unwrap();
        assert!(wait_connected(&router, &[VEHICLE, CLOUD]).await);

        let signer = ground_signer();
        let forged = tampered(&signer.sign(&heartbeat(0)));
        let genuine = signer.sign(&heartbeat(1));
        vehicle.send(&forged).await.unwrap();
        vehicle.send(&genuine).await.unwrap();

        assert_eq!(cloud.recv(WAIT).await, Some(genuine));
        assert!(eventually(|| router.stats().signature_failures == 1).await);
        let stats = router.stats();
        assert_eq!(stats.uplink_frames, 2);
        assert_eq!(stats.dropped_frames, 0);

        router.stop().await;
    }

    #[tokio::test]
    async fn test_invalid_signature_forwarded_when_not_rejecting() {
        let host = MockSerialHost::ready();
        let relay = CloudRelay::bind().await.unwrap();
        let router = start(
            &host,
            &relay,
            RouterConfig {
                signing: Some(signing(false)),
                ..fast_config()
            },
        );

        let mut cloud = relay.accept().await.unwrap();
        let mut vehicle = host.next_link().await.unwrap();
        assert!(wait_connected(&router, &[VEHICLE, CLOUD]).await);

        let forged = tampered(&ground_signer().sign(&heartbeat(0)));
        vehicle.send(&forged).await.unwrap();

        assert_eq!(cloud.recv(WAIT).await, Some(forged));
        assert!(eventually(|| router.stats().signature_failures == 1).await);

        router.stop().await;
    }

    #[tokio::test]
    async fn test_unsigned_uplink_passes() {
        let host = MockSerialHost::ready();
        let relay = CloudRelay::bind().await.unwrap();
        let router = start(
            &host,
            &relay,
            RouterConfig {
                signing: Some(signing(true)),
                ..fast_config()
            },
        );

        let mut cloud = relay.accept().await.unwrap();
        let mut vehicle = host.next_link().await.unwrap();
        assert!(wait_connected(&router, &[VEHICLE, CLOUD]).await);

        let frame = heartbeat(3);
        vehicle.send(&frame).await.unwrap();
        assert_eq!(cloud.recv(WAIT).await, Some(frame));
        assert_eq!(router.stats().signature_failures, 0);

        router.stop().await;
    }

    #[tokio::test]
    async fn test_injected_signed_only_toward_vehicle() {
        let host = MockSerialHost::ready();
        let relay = CloudRelay::bind().await.unwrap();
        let router = start(
            &host,
            &relay,
            RouterConfig {
                injection: Some(InjectionConfig::default()),
                signing: Some(signing(true)),
                ..fast_config()
            },
        );

        let mut cloud = relay.accept().await.unwrap();
        let mut vehicle = host.next_link().await.unwrap();
        assert!(wait_connected(&router, &[VEHICLE, CLOUD, INJECTOR]).await);

        assert!(router
            .injector()
            .submit(SensorMessage::new("baro", 29, 115, vec![9; 14]))
            .is_queued());

        let at_vehicle = vehicle.recv(WAIT).await.unwrap();
        let at_cloud = cloud.recv(WAIT).await.unwrap();
        assert!(at_vehicle.is_signed());
        assert!(ground_signer().validate(&at_vehicle));
        assert!(!at_cloud.is_signed());
        assert!(at_cloud.validate_checksum(115));
        assert_eq!(at_vehicle.sequence(), at_cloud.sequence());

        router.stop().await;
    }
}
