//! # Pipeline Guarantees
//!
//! Per-subscription ordering, isolation of failing handlers and converter
//! selection precedence, observed end to end.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use bus_converter::{
        ConverterSelection, Predicate, PredicateConverterList, StringConverter, WireType,
    };
    use bus_types::{Event, FilterChain};
    use scope_bus::{async_handler, Bus, ParticipantConfig, TransportConfig};
    use tokio::sync::mpsc;
    use tokio::time::{sleep, timeout};

    use crate::integration::fixtures::{collector, group_pair, next, quiet, scope};

    #[tokio::test]
    async fn test_slow_subscription_keeps_order() {
        let bus = Bus::new(ParticipantConfig::default()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        bus.subscribe(
            &scope("/o/"),
            FilterChain::new(),
            async_handler(move |event: Event| {
                let tx = tx.clone();
                async move {
                    let value = event.payload.downcast_ref::<i64>().copied().unwrap_or(-1);
                    if value % 10 == 0 {
                        sleep(Duration::from_millis(5)).await;
                    }
                    tx.send(value)?;
                    Ok::<_, anyhow::Error>(())
                }
            }),
        )
        .await
        .unwrap();
        let (fast, mut fast_rx) = collector();
        bus.subscribe(&scope("/o/"), FilterChain::new(), fast)
            .await
            .unwrap();

        for i in 0..100i64 {
            bus.publish(&scope("/o/"), i).await.unwrap();
        }

        let mut seen = Vec::new();
        while seen.len() < 100 {
            let value = timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            seen.push(value);
        }
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
        for i in 0..100i64 {
            assert_eq!(next(&mut fast_rx).await.payload.downcast_ref::<i64>(), Some(&i));
        }
    }

    #[tokio::test]
    async fn test_failing_handlers_do_not_disturb_others() {
        let bus = Bus::new(ParticipantConfig::default()).unwrap();
        let mut errors = bus.handler_errors();
        let panicking = bus
            .subscribe(&scope("/i/"), FilterChain::new(), |_event: Event| -> anyhow::Result<()> {
                panic!("handler blew up")
            })
            .await
            .unwrap();
        bus.subscribe(&scope("/i/"), FilterChain::new(), |_event: Event| -> anyhow::Result<()> {
            anyhow::bail!("handler refused")
        })
        .await
        .unwrap();
        let (healthy, mut rx) = collector();
        bus.subscribe(&scope("/i/"), FilterChain::new(), healthy)
            .await
            .unwrap();

        let first = bus.publish(&scope("/i/"), 1i64).await.unwrap();
        let second = bus.publish(&scope("/i/"), 2i64).await.unwrap();
        assert_eq!(next(&mut rx).await.id, first.id);
        assert_eq!(next(&mut rx).await.id, second.id);

        let mut reports = Vec::new();
        while reports.len() < 4 {
            reports.push(
                timeout(Duration::from_secs(5), errors.recv())
                    .await
                    .unwrap()
                    .unwrap(),
            );
        }
        let panics: Vec<_> = reports.iter().filter(|r| r.panicked).collect();
        assert_eq!(panics.len(), 2);
        assert!(panics
            .iter()
            .all(|r| r.subscription_id == panicking.id() && r.message.contains("blew up")));
        assert!(reports
            .iter()
            .filter(|r| !r.panicked)
            .all(|r| r.message == "handler refused"));
    }

    fn ascii_preferred() -> Arc<dyn ConverterSelection> {
        let list = PredicateConverterList::new(WireType::Bytes);
        list.add_converter(Arc::new(StringConverter::default()), None, None)
            .unwrap();
        list.add_converter(
            Arc::new(StringConverter::ascii()),
            None,
            Some(Predicate::Always),
        )
        .unwrap();
        Arc::new(list)
    }

    #[tokio::test]
    async fn test_later_predicate_entry_wins() {
        let (first, second, _hub) = group_pair();
        let config = ParticipantConfig::empty()
            .with_transport(TransportConfig::new("group").enabled().with_converters(ascii_preferred()));
        let informer = first
            .create_informer_with(scope("/p/"), None, &config)
            .await
            .unwrap();
        let listener = second
            .create_listener_with(scope("/p/"), &config)
            .await
            .unwrap();
        let (handler, mut rx) = collector();
        listener.subscribe(FilterChain::new(), handler).unwrap();

        informer.publish("plain".to_string()).await.unwrap();
        let received = next(&mut rx).await;
        assert_eq!(
            received.payload.downcast_ref::<String>().map(String::as_str),
            Some("plain")
        );

        // ASCII was selected over UTF-8, so this cannot be encoded.
        assert!(informer.publish("h\u{e9}llo".to_string()).await.is_err());
        quiet(&mut rx).await;
    }
}
