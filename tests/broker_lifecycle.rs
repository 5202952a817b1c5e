//! Жизненный цикл тем: UNREFERENCED, destroy-delay, ttl, erase.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::{sync::broadcast, time::timeout};
use vestnik::{
    loopback, Broker, BrokerEvent, BrokerOptions, DeliveryItem, EraseQos, GetQos, PublishQos,
    SessionId, SubscriptionOptions, TargetSpec, TopicConfig, TopicState,
};

fn short_lived(history_max: usize) -> PublishQos {
    PublishQos {
        topic_config: Some(TopicConfig {
            history_max,
            destroy_delay: Duration::from_secs(5),
            ..TopicConfig::default()
        }),
        ..PublishQos::default()
    }
}

fn register(broker: &Broker, name: &str) -> (SessionId, vestnik::LoopbackReceiver) {
    let session = SessionId::new(name);
    let (channel, rx) = loopback(16);
    broker.register_session(session.clone(), channel);
    (session, rx)
}

/// Ожидает событие перехода темы `topic` в состояние `to`.
async fn wait_for_state(
    events: &mut broadcast::Receiver<BrokerEvent>,
    topic: &str,
    to: TopicState,
) {
    let deadline = Duration::from_millis(500);
    loop {
        let event = timeout(deadline, events.recv())
            .await
            .unwrap_or_else(|_| panic!("не дождались перехода {topic} -> {to}"))
            .expect("event channel closed");
        if let BrokerEvent::TopicState {
            topic: t, to: got, ..
        } = event
        {
            if &*t == topic && got == to {
                return;
            }
        }
    }
}

/// Публикация без подписчиков и без истории: тема становится UNREFERENCED
/// сразу после возврата publish, а по истечении destroy-delay умирает.
#[tokio::test(start_paused = true)]
async fn unreferenced_topic_dies_after_destroy_delay() {
    let broker = Broker::new(BrokerOptions::default());
    let (alice, _rx) = register(&broker, "alice");
    let mut events = broker.events();

    broker
        .publish(&alice, "ephemeral", Bytes::from_static(b"x"), short_lived(0))
        .unwrap();
    assert_eq!(
        broker.topic_state("ephemeral"),
        Some(TopicState::Unreferenced)
    );

    tokio::time::advance(Duration::from_secs(6)).await;
    tokio::task::yield_now().await;

    assert_eq!(broker.topic_state("ephemeral"), None);
    wait_for_state(&mut events, "ephemeral", TopicState::Dead).await;
}

/// Новая публикация до срабатывания destroy-таймера возвращает тему в
/// ALIVE и отменяет старый таймер: тема не умирает от просроченного
/// поколения.
#[tokio::test(start_paused = true)]
async fn publish_cancels_pending_destroy_timer() {
    let broker = Broker::new(BrokerOptions::default());
    let (alice, _rx) = register(&broker, "alice");

    broker
        .publish(&alice, "revived", Bytes::from_static(b"a"), short_lived(0))
        .unwrap();
    assert_eq!(broker.topic_state("revived"), Some(TopicState::Unreferenced));

    // за 2 секунды до смерти тема оживает
    tokio::time::advance(Duration::from_secs(3)).await;
    broker
        .publish(&alice, "revived", Bytes::from_static(b"b"), short_lived(0))
        .unwrap();
    assert_eq!(broker.topic_state("revived"), Some(TopicState::Unreferenced));

    // старый таймер (t=5s) уже просрочен, но его поколение устарело
    tokio::time::advance(Duration::from_secs(3)).await;
    tokio::task::yield_now().await;
    assert_eq!(broker.topic_state("revived"), Some(TopicState::Unreferenced));

    // новый таймер (t=8s) добивает тему
    tokio::time::advance(Duration::from_secs(3)).await;
    tokio::task::yield_now().await;
    assert_eq!(broker.topic_state("revived"), None);
}

/// Подписка, пришедшая в UNREFERENCED, отменяет снос.
#[tokio::test(start_paused = true)]
async fn subscribe_cancels_pending_destroy_timer() {
    let broker = Broker::new(BrokerOptions::default());
    let (alice, _rx) = register(&broker, "alice");

    broker
        .publish(&alice, "wanted", Bytes::from_static(b"a"), short_lived(0))
        .unwrap();
    assert_eq!(broker.topic_state("wanted"), Some(TopicState::Unreferenced));

    broker
        .subscribe(&alice, TargetSpec::exact("wanted"), SubscriptionOptions::default())
        .unwrap();
    assert_eq!(broker.topic_state("wanted"), Some(TopicState::Alive));

    tokio::time::advance(Duration::from_secs(10)).await;
    tokio::task::yield_now().await;
    assert_eq!(broker.topic_state("wanted"), Some(TopicState::Alive));
}

/// Истечение ttl изымает запись из истории; оставшись без записей и
/// подписчиков, тема уходит в UNREFERENCED.
#[tokio::test(start_paused = true)]
async fn ttl_expiry_drains_history() {
    let broker = Broker::new(BrokerOptions::default());
    let (alice, _rx) = register(&broker, "alice");

    let qos = PublishQos {
        ttl: Some(Duration::from_secs(2)),
        ..short_lived(4)
    };
    broker
        .publish(&alice, "volatileish", Bytes::from_static(b"x"), qos)
        .unwrap();
    assert_eq!(broker.topic_state("volatileish"), Some(TopicState::Alive));
    let got = broker
        .get(&alice, &TargetSpec::exact("volatileish"), &GetQos::default())
        .unwrap();
    assert_eq!(got.len(), 1);

    tokio::time::advance(Duration::from_secs(3)).await;
    tokio::task::yield_now().await;

    assert_eq!(
        broker.topic_state("volatileish"),
        Some(TopicState::Unreferenced)
    );
    let got = broker
        .get(&alice, &TargetSpec::exact("volatileish"), &GetQos::default())
        .unwrap();
    assert!(got.is_empty());
}

/// Мягкий erase при удерживаемой очередью записи: тема уходит в
/// SOFT_ERASED и умирает только после того, как подписчик отпустит
/// последнюю ссылку.
#[tokio::test]
async fn soft_erase_defers_teardown_until_refs_drain() {
    let broker = Broker::new(BrokerOptions::default());
    let (alice, rx) = register(&broker, "alice");
    let mut events = broker.events();

    broker
        .subscribe(&alice, TargetSpec::exact("held"), SubscriptionOptions::default())
        .unwrap();
    broker
        .publish(&alice, "held", Bytes::from_static(b"keep"), PublishQos::default())
        .unwrap();

    let update = match timeout(Duration::from_millis(200), rx.recv())
        .await
        .expect("timed out")
        .expect("channel closed")
    {
        DeliveryItem::Update(update) => update,
        other => panic!("ожидалось сообщение, пришло {other:?}"),
    };

    let affected = broker
        .erase(&alice, &TargetSpec::exact("held"), &EraseQos::default())
        .unwrap();
    assert_eq!(affected, vec![Arc::<str>::from("held")]);
    wait_for_state(&mut events, "held", TopicState::SoftErased).await;

    // ссылка очереди ещё жива — DEAD наступает только после ack
    update.ack();
    wait_for_state(&mut events, "held", TopicState::Dead).await;
}

/// Принудительный erase побеждает из любого состояния: ссылки очередей
/// не задерживают снос.
#[tokio::test]
async fn force_erase_wins_immediately() {
    let broker = Broker::new(BrokerOptions::default());
    let (alice, rx) = register(&broker, "alice");
    let mut events = broker.events();

    broker
        .subscribe(&alice, TargetSpec::exact("doomed"), SubscriptionOptions::default())
        .unwrap();
    broker
        .publish(&alice, "doomed", Bytes::from_static(b"x"), PublishQos::default())
        .unwrap();
    // сообщение не подтверждаем — ссылка очереди остаётся
    let _held = rx.try_recv();

    broker
        .erase(
            &alice,
            &TargetSpec::exact("doomed"),
            &EraseQos { force_destroy: true },
        )
        .unwrap();
    wait_for_state(&mut events, "doomed", TopicState::Dead).await;
    assert_eq!(broker.topic_state("doomed"), None);
}

/// Повторный unsubscribe — NotFound, без порчи состояния.
#[tokio::test]
async fn unsubscribe_twice_is_not_found() {
    let broker = Broker::new(BrokerOptions::default());
    let (alice, _rx) = register(&broker, "alice");

    let id = broker
        .subscribe(&alice, TargetSpec::exact("once"), SubscriptionOptions::default())
        .unwrap();
    broker.unsubscribe(&alice, &id).unwrap();

    let err = broker.unsubscribe(&alice, &id).unwrap_err();
    assert!(matches!(err, vestnik::BrokerError::SubscriptionNotFound(_)));

    // брокер работоспособен: публикация в другую тему проходит
    broker
        .publish(&alice, "alive", Bytes::from_static(b"ok"), PublishQos::default())
        .unwrap();
}

/// Последний unsubscribe на теме без записей ведёт её к UNREFERENCED
/// и затем к DEAD.
#[tokio::test(start_paused = true)]
async fn last_unsubscribe_drives_topic_down() {
    let broker = Broker::new(BrokerOptions::default());
    let (alice, rx) = register(&broker, "alice");

    let id = broker
        .subscribe(&alice, TargetSpec::exact("brief"), SubscriptionOptions::default())
        .unwrap();
    broker
        .publish(&alice, "brief", Bytes::from_static(b"x"), short_lived(0))
        .unwrap();
    // доставленное сообщение подтверждаем, чтобы ссылка очереди ушла
    if let Some(DeliveryItem::Update(update)) = rx.try_recv() {
        update.ack();
    }
    assert_eq!(broker.topic_state("brief"), Some(TopicState::Alive));

    broker.unsubscribe(&alice, &id).unwrap();
    assert_eq!(broker.topic_state("brief"), Some(TopicState::Unreferenced));

    tokio::time::advance(Duration::from_secs(6)).await;
    tokio::task::yield_now().await;
    assert_eq!(broker.topic_state("brief"), None);
}
