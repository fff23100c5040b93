use log::{debug, error};
use serde::Serialize;

use crate::codec::envelope::{CHART_UPDATE, REALTIME_TICK};
use crate::codec::{encode_response, RealTimeTick, ResponseEnvelope};
use crate::data::Bar;
use crate::feed::TickSink;
use crate::session::SessionRegistry;

/// Fans feed ticks and poller output out to every live session.
/// Delivery is fire-and-forget per session.
#[derive(Clone)]
pub struct BroadcastHub {
    registry: SessionRegistry,
}

impl BroadcastHub {
    pub fn new(registry: SessionRegistry) -> Self {
        Self { registry }
    }

    /// Wrap `data` in a success envelope of `response_type` and send it to
    /// all sessions. Returns the number of sessions that accepted it.
    pub fn publish<T: Serialize>(&self, response_type: &str, data: &T) -> usize {
        let data = match serde_json::to_value(data) {
            Ok(value) => value,
            Err(e) => {
                error!("Failed to serialize {} broadcast: {}", response_type, e);
                return 0;
            }
        };

        let message = encode_response(&ResponseEnvelope::success(response_type, None, data));
        self.registry.broadcast(&message)
    }

    pub fn publish_tick(&self, tick: &RealTimeTick) -> usize {
        self.publish(REALTIME_TICK, tick)
    }

    pub fn publish_chart(&self, bars: &[Bar]) -> usize {
        self.publish(CHART_UPDATE, &bars)
    }
}

impl TickSink for BroadcastHub {
    fn on_tick(&self, tick: RealTimeTick) {
        let delivered = self.publish_tick(&tick);
        debug!(
            "Tick {} {} @ {} delivered to {} sessions",
            tick.ticker, tick.trade_time, tick.current_price, delivered
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::tick::tests::sample_frame;
    use crate::codec::decode_tick;
    use crate::data::store::tests::{at, bar};
    use crate::session::SessionHandle;
    use serde_json::Value;

    #[test]
    fn test_tick_reaches_every_session() {
        let registry = SessionRegistry::new();
        let hub = BroadcastHub::new(registry.clone());
        let mut receivers = Vec::new();
        for i in 0..3 {
            let (handle, rx) = SessionHandle::new(format!("peer-{}", i));
            registry.add(handle);
            receivers.push(rx);
        }

        hub.on_tick(decode_tick(&sample_frame()).unwrap());

        for rx in receivers.iter_mut() {
            let value: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
            assert_eq!(value["type"], REALTIME_TICK);
            assert_eq!(value["status"], "SUCCESS");
            assert_eq!(value["data"]["ticker"], "005930");
            assert_eq!(value["data"]["currentPrice"], 71900.0);
        }
    }

    #[test]
    fn test_publish_ignores_subscriptions() {
        let registry = SessionRegistry::new();
        let hub = BroadcastHub::new(registry.clone());
        let (handle, mut rx) = SessionHandle::new("peer");
        let id = handle.id();
        registry.add(handle);
        registry.note_subscription(id, "000660");

        let bars = vec![bar("005930", at(9, 0), 100.0, 101.0, 10)];
        assert_eq!(hub.publish_chart(&bars), 1);

        let value: Value = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert_eq!(value["type"], CHART_UPDATE);
        assert_eq!(value["data"].as_array().unwrap().len(), 1);
    }

    #[test]
    fn test_publish_without_sessions() {
        let hub = BroadcastHub::new(SessionRegistry::new());
        assert_eq!(hub.publish_chart(&[]), 0);
    }
}
