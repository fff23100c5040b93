pub mod envelope;
pub mod tick;

pub use envelope::{
    decode_request, encode_response, RequestEnvelope, RequestType, ResponseEnvelope, TickerPayload,
};
pub use tick::{decode_tick, encode_subscription, is_control_frame, RealTimeTick};
