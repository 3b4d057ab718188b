//! # Request/Reply
//!
//! Remote servers on one bus calling local servers on another, with replies
//! matched to requests by cause id.

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::bail;
    use bus_types::{Event, Payload};
    use scope_bus::{Bus, BusError, FutureError, ParticipantConfig};

    use crate::integration::fixtures::{group_pair, scope, socket_pair};

    fn double(request: Event) -> anyhow::Result<Payload> {
        match request.payload.downcast_ref::<i64>() {
            Some(value) => Ok(Payload::new(value * 2)),
            None => bail!("expected an integer, got {}", request.data_type()),
        }
    }

    fn shout(request: Event) -> anyhow::Result<Payload> {
        let text = request.payload.downcast_ref::<String>().cloned().unwrap_or_default();
        Ok(Payload::new(text.to_uppercase()))
    }

    #[tokio::test]
    async fn test_inprocess_round_trip() {
        let bus = Bus::new(ParticipantConfig::default()).unwrap();
        let local = bus.create_local_server(scope("/math/"));
        local.add_method("double", double).await.unwrap();
        local.add_method("shout", shout).await.unwrap();
        let remote = bus.create_remote_server(scope("/math/"));

        let doubled: i64 = remote
            .call("double", 21i64, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(doubled, 42);
        let loud: String = remote
            .call("shout", "quiet".to_string(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(loud, "QUIET");
        assert_eq!(remote.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_calls_are_correlated() {
        let bus = Bus::new(ParticipantConfig::default()).unwrap();
        let local = bus.create_local_server(scope("/c/"));
        local.add_method("double", double).await.unwrap();
        let remote = bus.create_remote_server(scope("/c/"));

        let mut futures = Vec::new();
        for i in 0..20i64 {
            futures.push((i, remote.invoke("double", i, Duration::from_secs(5)).await.unwrap()));
        }
        for (i, future) in futures {
            let reply = future.wait().await.unwrap();
            assert_eq!(reply.cause_id(), Some(future.request_id()));
            assert_eq!(reply.payload.downcast_ref::<i64>(), Some(&(i * 2)));
        }
    }

    #[tokio::test]
    async fn test_remote_error_reaches_caller() {
        let bus = Bus::new(ParticipantConfig::default()).unwrap();
        let local = bus.create_local_server(scope("/e/"));
        local.add_method("double", double).await.unwrap();

        let future = bus
            .invoke(&scope("/e/"), "double", "not a number".to_string(), Duration::from_secs(5))
            .await
            .unwrap();
        match future.wait().await {
            Err(FutureError::Remote(message)) => assert!(message.contains("expected an integer")),
            other => panic!("expected a remote error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_server_times_out() {
        let bus = Bus::new(ParticipantConfig::default()).unwrap();
        let remote = bus.create_remote_server(scope("/nobody/"));
        let result: Result<i64, BusError> = remote
            .call("double", 1i64, Duration::from_millis(50))
            .await;
        assert!(matches!(
            result,
            Err(BusError::Future(FutureError::Timeout(_)))
        ));
        assert_eq!(remote.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_socket_round_trip() {
        let (server, client) = socket_pair();
        let local = server.create_local_server(scope("/svc/"));
        local.add_method("shout", shout).await.unwrap();
        let remote = client.create_remote_server(scope("/svc/"));

        let loud: String = remote
            .call("shout", "over tcp".to_string(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(loud, "OVER TCP");
    }

    #[tokio::test]
    async fn test_group_round_trip() {
        let (first, second, _hub) = group_pair();
        let local = first.create_local_server(scope("/grp/"));
        local.add_method("double", double).await.unwrap();
        let remote = second.create_remote_server(scope("/grp/"));

        let doubled: i64 = remote
            .call("double", 50i64, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(doubled, 100);
    }
}
