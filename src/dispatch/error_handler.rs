use tracing::{error, warn};

use super::channel::{DeliveryItem, FanoutFailure, SessionId};
use crate::{
    broker::{system_session, BrokerCore, BrokerEvent},
    msgstore::PublishQos,
    topic::TopicConfig,
};

/// Системная тема недоставленных сообщений.
pub const DEAD_LETTER_TOPIC: &str = "__sys__dead_letter";

impl BrokerCore {
    /// Политика обработки отказов доставки.
    ///
    /// Каждый отказ эскалируется ровно один раз на запись и очередь:
    /// элемент уходит в dead letters, а терминальная для сеанса ошибка
    /// (мёртвый канал) дополнительно осушает очередь подписчика и
    /// завершает его сеанс. Отказ по содержимому терминален только для
    /// одного сообщения.
    pub(crate) fn handle_delivery_failures(&self, failures: Vec<FanoutFailure>) {
        for failure in failures {
            warn!(
                session = %failure.session,
                topic = %failure.item.topic(),
                reason = %failure.reason,
                subscription = ?failure.sub_id,
                "delivery failed"
            );
            let fatal = failure.reason.is_session_fatal();
            let session = failure.session.clone();
            let reason = failure.reason.to_string();
            self.dead_letter(failure.item, &session, &reason);
            if fatal {
                self.terminate_session(&session, &reason);
            }
        }
    }

    /// Републикует недоставленный элемент на системную dead-letter тему.
    ///
    /// Dead letter для самой dead-letter темы не публикуется — только
    /// логируется, иначе отказ её подписчика зациклил бы тракт.
    pub(crate) fn dead_letter(&self, item: DeliveryItem, session: &SessionId, reason: &str) {
        let DeliveryItem::Update(update) = item else {
            // прощальные уведомления не содержат записи — нечего сохранять
            return;
        };
        if &*update.topic == DEAD_LETTER_TOPIC {
            error!(session = %session, reason, "dead letter undeliverable, dropping");
            return;
        }

        let origin_topic = update.topic.clone();
        let entry_id = update.entry.id;
        let payload = update.entry.payload.clone();

        let mut qos = PublishQos::default();
        qos.force_update = true;
        qos.topic_config = Some(TopicConfig {
            history_max: self.dead_letter_history,
            ..TopicConfig::default()
        });
        qos.attrs
            .insert("origin.topic".into(), origin_topic.to_string());
        qos.attrs.insert("origin.entry".into(), entry_id.to_string());
        qos.attrs
            .insert("origin.session".into(), session.to_string());
        qos.attrs.insert("reason".into(), reason.to_string());

        // ссылка исходной очереди снимается до републикации
        drop(update);

        if let Err(e) = self.publish_unchecked(system_session(), DEAD_LETTER_TOPIC, payload, qos) {
            error!(origin = %origin_topic, %e, "dead letter publish failed");
        }
        let _ = self.events.send(BrokerEvent::DeadLetter {
            topic: origin_topic,
            entry: entry_id,
            session: session.clone(),
            reason: reason.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use tokio::time::timeout;

    use super::*;
    use crate::dispatch::channel::DeliveryChannel;
    use crate::{
        broker::{Broker, BrokerOptions},
        dispatch::loopback,
        msgstore::GetQos,
        subscription::{SubscriptionOptions, TargetSpec},
        topic::TopicState,
    };

    /// Тест проверяет, что переполнение очереди подписчика рождает
    /// dead letter с атрибутами происхождения.
    #[tokio::test]
    async fn test_queue_overflow_dead_letter() {
        let broker = Broker::new(BrokerOptions::default());

        let alice = crate::dispatch::SessionId::new("alice");
        let (tiny, _tiny_rx) = loopback(1);
        broker.register_session(alice.clone(), tiny);

        let ops = crate::dispatch::SessionId::new("ops");
        let (ops_channel, ops_rx) = loopback(8);
        broker.register_session(ops.clone(), ops_channel);
        broker
            .subscribe(&ops, TargetSpec::exact(DEAD_LETTER_TOPIC), SubscriptionOptions::default())
            .unwrap();

        broker
            .subscribe(&alice, TargetSpec::exact("busy"), SubscriptionOptions::default())
            .unwrap();
        // первая публикация занимает единственный слот очереди
        broker
            .publish(&alice, "busy", Bytes::from_static(b"first"), PublishQos::default())
            .unwrap();
        // вторая не помещается и уходит в dead letters
        broker
            .publish(&alice, "busy", Bytes::from_static(b"second"), PublishQos::default())
            .unwrap();

        let item = timeout(Duration::from_millis(200), ops_rx.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        let super::DeliveryItem::Update(update) = item else {
            panic!("expected dead letter update");
        };
        assert_eq!(&*update.topic, DEAD_LETTER_TOPIC);
        assert_eq!(update.entry.payload, Bytes::from_static(b"second"));
        assert_eq!(update.entry.attrs.get("origin.topic").unwrap(), "busy");
        assert_eq!(update.entry.attrs.get("origin.session").unwrap(), "alice");
        assert_eq!(
            update.entry.attrs.get("reason").unwrap(),
            "delivery queue is full"
        );
    }

    /// Тест проверяет, что мёртвый канал завершает сеанс целиком:
    /// подписки сняты, тема уходит в UNREFERENCED.
    #[tokio::test]
    async fn test_closed_channel_terminates_session() {
        let broker = Broker::new(BrokerOptions::default());
        let alice = crate::dispatch::SessionId::new("alice");
        let (channel, rx) = loopback(8);
        broker.register_session(alice.clone(), channel.clone());
        broker
            .subscribe(
                &alice,
                TargetSpec::exact("doomed"),
                SubscriptionOptions::default(),
            )
            .unwrap();

        // транспорт умер, брокер ещё не знает
        drop(rx);
        let _ = channel.terminate();

        let qos = PublishQos {
            topic_config: Some(TopicConfig::no_history()),
            ..PublishQos::default()
        };
        broker
            .publish(&alice, "doomed", Bytes::from_static(b"x"), qos)
            .unwrap();

        // сеанс снят вместе с подпиской, тема осталась без ссылок
        assert_eq!(broker.topic_state("doomed"), Some(TopicState::Unreferenced));
        let system = system_session().clone();
        let letters = broker
            .get(&system, &TargetSpec::exact(DEAD_LETTER_TOPIC), &GetQos::default())
            .unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(
            letters[0].attrs.get("reason").unwrap(),
            "delivery channel is closed"
        );
    }

    /// Тест проверяет, что отказ подписчика самой dead-letter темы не
    /// зацикливает тракт.
    #[tokio::test]
    async fn test_dead_letter_topic_never_recurses() {
        let broker = Broker::new(BrokerOptions::default());

        let ops = crate::dispatch::SessionId::new("ops");
        let (tiny, _tiny_rx) = loopback(1);
        broker.register_session(ops.clone(), tiny.clone());
        broker
            .subscribe(&ops, TargetSpec::exact(DEAD_LETTER_TOPIC), SubscriptionOptions::default())
            .unwrap();

        let alice = crate::dispatch::SessionId::new("alice");
        let (one, _one_rx) = loopback(1);
        broker.register_session(alice.clone(), one);
        broker
            .subscribe(&alice, TargetSpec::exact("busy"), SubscriptionOptions::default())
            .unwrap();

        broker
            .publish(&alice, "busy", Bytes::from_static(b"a"), PublishQos::default())
            .unwrap();
        // обе очереди (alice и ops) по одному слоту: второй отказ alice
        // рождает dead letter, который занимает слот ops; третий отказ
        // alice рождает dead letter, которому у ops уже нет места —
        // рекурсия обязана оборваться логом, а не переполнением стека
        broker
            .publish(&alice, "busy", Bytes::from_static(b"b"), PublishQos::default())
            .unwrap();
        broker
            .publish(&alice, "busy", Bytes::from_static(b"c"), PublishQos::default())
            .unwrap();

        // dead-letter тема хранит оба письма в истории
        let system = system_session().clone();
        let letters = broker
            .get(
                &system,
                &TargetSpec::exact(DEAD_LETTER_TOPIC),
                &GetQos {
                    depth: 16,
                    newest_first: false,
                },
            )
            .unwrap();
        assert_eq!(letters.len(), 2);
    }
}
