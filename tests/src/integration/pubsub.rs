//! # Scoped Publish/Subscribe Across Transports
//!
//! A listener receives events on its scope and every sub-scope, nothing
//! else, whichever transport carried them.

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use bus_types::{Event, FilterChain, MethodFilter, Payload};
    use scope_bus::{Bus, ParticipantConfig};
    use tokio::time::{sleep, timeout};
    use tokio_stream::StreamExt;

    use crate::integration::fixtures::{
        collector, group_pair, next, quiet, scope, socket_pair, SETTLE,
    };

    // =========================================================================
    // INPROCESS
    // =========================================================================

    #[tokio::test]
    async fn test_inprocess_delivers_sub_scopes_only() {
        let bus = Bus::new(ParticipantConfig::default()).unwrap();
        let (handler, mut rx) = collector();
        bus.subscribe(&scope("/a/"), FilterChain::new(), handler)
            .await
            .unwrap();

        let on_scope = bus.publish(&scope("/a/"), 1i64).await.unwrap();
        let below = bus.publish(&scope("/a/b/c/"), 2i64).await.unwrap();
        bus.publish(&scope("/"), 3i64).await.unwrap();
        bus.publish(&scope("/ab/"), 4i64).await.unwrap();

        assert_eq!(next(&mut rx).await.id, on_scope.id);
        let received = next(&mut rx).await;
        assert_eq!(received.id, below.id);
        assert!(received.payload.ptr_eq(&below.payload));
        quiet(&mut rx).await;
    }

    #[tokio::test]
    async fn test_inprocess_participants_share_one_bus_only() {
        let first = Bus::new(ParticipantConfig::default()).unwrap();
        let second = Bus::new(ParticipantConfig::default()).unwrap();
        let (handler, mut rx) = collector();
        second
            .subscribe(&scope("/x/"), FilterChain::new(), handler)
            .await
            .unwrap();

        first.publish(&scope("/x/"), true).await.unwrap();
        quiet(&mut rx).await;
    }

    #[tokio::test]
    async fn test_metadata_survives_delivery() {
        let bus = Bus::new(ParticipantConfig::default()).unwrap();
        let (handler, mut rx) = collector();
        bus.subscribe(&scope("/m/"), FilterChain::new(), handler)
            .await
            .unwrap();

        let cause = bus.publish(&scope("/m/"), 0i64).await.unwrap();
        let cause_id = next(&mut rx).await.id.unwrap();
        let event = Event::new(scope("/m/"), Payload::new(1i64))
            .with_method("UPDATE")
            .with_cause(cause_id)
            .with_user_info("origin", "test");
        bus.publish_event(event).await.unwrap();

        let received = next(&mut rx).await;
        assert_eq!(cause.id, Some(cause_id));
        assert!(received.has_method("UPDATE"));
        assert!(received.is_caused_by(&cause_id));
        assert_eq!(
            received.meta_data.user_infos.get("origin").map(String::as_str),
            Some("test")
        );
        assert!(received.meta_data.send_time.is_some());
        assert!(received.meta_data.deliver_time.is_some());
    }

    // =========================================================================
    // SOCKET
    // =========================================================================

    #[tokio::test]
    async fn test_socket_delivers_between_buses() {
        let (server, client) = socket_pair();
        let (server_handler, mut server_rx) = collector();
        let (client_handler, mut client_rx) = collector();
        server
            .subscribe(&scope("/news/"), FilterChain::new(), server_handler)
            .await
            .unwrap();
        client
            .subscribe(&scope("/news/"), FilterChain::new(), client_handler)
            .await
            .unwrap();
        sleep(SETTLE).await;

        let from_server = server
            .publish(&scope("/news/sport/"), "goal".to_string())
            .await
            .unwrap();
        let received = next(&mut client_rx).await;
        assert_eq!(received.id, from_server.id);
        assert_eq!(received.scope, scope("/news/sport/"));
        assert_eq!(
            received.payload.downcast_ref::<String>().map(String::as_str),
            Some("goal")
        );
        // The publishing bus sees its own event too.
        assert_eq!(next(&mut server_rx).await.id, from_server.id);

        let from_client = client.publish(&scope("/news/"), 42i64).await.unwrap();
        let received = next(&mut server_rx).await;
        assert_eq!(received.id, from_client.id);
        assert_eq!(received.payload.downcast_ref::<i64>(), Some(&42));
        assert_eq!(next(&mut client_rx).await.id, from_client.id);

        client.publish(&scope("/weather/"), 1i64).await.unwrap();
        quiet(&mut server_rx).await;
    }

    #[tokio::test]
    async fn test_socket_reader_stream() {
        let (server, client) = socket_pair();
        let reader = server.create_reader(scope("/r/")).await.unwrap();
        let informer = client.create_informer::<String>(scope("/r/")).await.unwrap();
        sleep(SETTLE).await;

        for word in ["one", "two", "three"] {
            informer.publish(word.to_string()).await.unwrap();
        }
        let words: Vec<String> = timeout(
            Duration::from_secs(5),
            reader
                .take(3)
                .map(|event| event.payload.downcast_ref::<String>().cloned().unwrap())
                .collect(),
        )
        .await
        .unwrap();
        assert_eq!(words, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn test_socket_payload_without_converter_is_rejected() {
        let (server, client) = socket_pair();
        server.create_listener(scope("/c/")).await.unwrap();
        let result = client.publish(&scope("/c/"), HashMap::<u8, u8>::new()).await;
        assert!(matches!(result, Err(scope_bus::BusError::Converter(_))));
    }

    // =========================================================================
    // GROUP
    // =========================================================================

    #[tokio::test]
    async fn test_group_delivers_to_super_scope_listeners() {
        let (first, second, hub) = group_pair();
        let (root_handler, mut root_rx) = collector();
        let (leaf_handler, mut leaf_rx) = collector();
        second
            .subscribe(&scope("/g/"), FilterChain::new(), root_handler)
            .await
            .unwrap();
        second
            .subscribe(&scope("/g/h/i/"), FilterChain::new(), leaf_handler)
            .await
            .unwrap();

        let deep = first.publish(&scope("/g/h/i/j/"), 7i64).await.unwrap();
        let shallow = first.publish(&scope("/g/h/"), 8i64).await.unwrap();

        assert_eq!(next(&mut root_rx).await.id, deep.id);
        assert_eq!(next(&mut root_rx).await.id, shallow.id);
        assert_eq!(next(&mut leaf_rx).await.id, deep.id);
        quiet(&mut leaf_rx).await;
        assert_eq!(hub.session_count(), 2);
    }

    #[tokio::test]
    async fn test_group_listener_filters() {
        let (first, second, _hub) = group_pair();
        let listener = second.create_listener(scope("/f/")).await.unwrap();
        listener.add_filter(std::sync::Arc::new(MethodFilter::new("KEEP")));
        let (handler, mut rx) = collector();
        listener.subscribe(FilterChain::new(), handler).unwrap();

        first
            .publish_event(Event::new(scope("/f/"), Payload::new(1i64)).with_method("DROP"))
            .await
            .unwrap();
        let kept = first
            .publish_event(Event::new(scope("/f/"), Payload::new(2i64)).with_method("KEEP"))
            .await
            .unwrap();

        assert_eq!(next(&mut rx).await.id, kept.id);
        quiet(&mut rx).await;
    }
}
