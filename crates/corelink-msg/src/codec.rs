//! JSON envelope codec glue.
//!
//! The transport below this layer only moves opaque byte payloads; it
//! owns framing and delivery order. Here we only turn [`Message`]
//! values into bytes and back, validating the declared list counts on
//! the way in.

use crate::error::{MsgError, Result};
use crate::message::Message;

/// Serialize a message for the inter-core transport.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(msg)?)
}

/// Deserialize an inbound payload, rejecting inconsistent list counts.
pub fn decode_message(payload: &[u8]) -> Result<Message> {
    let msg: Message = serde_json::from_slice(payload)?;
    match &msg {
        Message::TransformDisconnectReq {
            count,
            transform_ids,
        } if *count != transform_ids.len() => Err(MsgError::CountMismatch {
            message: "transform_disconnect_req",
            declared: *count,
            actual: transform_ids.len(),
        }),
        Message::TransformListRemoveEntryReq {
            count,
            transform_ids,
        } if *count != transform_ids.len() => Err(MsgError::CountMismatch {
            message: "transform_list_remove_entry_req",
            declared: *count,
            actual: transform_ids.len(),
        }),
        _ => Ok(msg),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelId;
    use crate::endpoint::EndpointId;
    use crate::message::TransformId;
    use crate::status::Status;

    #[test]
    fn round_trips_connect_req() {
        let msg = Message::ConnectReq {
            source_id: EndpointId(0x4001),
            sink_id: EndpointId(0x8002),
            transform_id: TransformId(7),
            channel_id: ChannelId(0x0005),
        };
        let bytes = encode_message(&msg).unwrap();
        assert_eq!(decode_message(&bytes).unwrap(), msg);
    }

    #[test]
    fn round_trips_disconnect_res() {
        let msg = Message::TransformDisconnectRes {
            status: Status::Ok,
            count: 2,
        };
        let bytes = encode_message(&msg).unwrap();
        assert_eq!(decode_message(&bytes).unwrap(), msg);
    }

    #[test]
    fn rejects_count_mismatch() {
        let msg = Message::TransformDisconnectReq {
            count: 3,
            transform_ids: vec![TransformId(1)],
        };
        let bytes = encode_message(&msg).unwrap();
        assert!(matches!(
            decode_message(&bytes),
            Err(MsgError::CountMismatch { declared: 3, .. })
        ));
    }

    #[test]
    fn rejects_malformed_payload() {
        assert!(matches!(
            decode_message(b"{not-json"),
            Err(MsgError::Json(_))
        ));
    }
}
