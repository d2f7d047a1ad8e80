//! Response construction and delivery
//!
//! Responses are built with `stun-rs`. When the request was authenticated
//! a trailing MESSAGE-INTEGRITY attribute is filled in by the encoder.

use crate::error::{reason_phrase, Result};
use std::net::SocketAddr;
use stun_rs::attributes::stun::{ErrorCode, MessageIntegrity, Nonce, Realm};
use stun_rs::attributes::turn::{Data, XorPeerAddress};
use stun_rs::methods::DATA;
use stun_rs::{
    HMACKey, MessageClass, MessageEncoderBuilder, StunAttribute, StunMessage, StunMessageBuilder,
};

// Room for the header and the attributes of any control response
const RESPONSE_BUFFER_SIZE: usize = 2048;

/// Encodes a message into a freshly allocated buffer
pub fn encode(message: &StunMessage, payload_hint: usize) -> Result<Vec<u8>> {
    let encoder = MessageEncoderBuilder::default().build();
    let mut buf = vec![0; RESPONSE_BUFFER_SIZE + payload_hint];
    let size = encoder.encode(&mut buf, message)?;
    buf.truncate(size);
    Ok(buf)
}

/// Builds and encodes a success response, signed when `key` is set
pub fn success(
    request: &StunMessage,
    mut attributes: Vec<StunAttribute>,
    key: Option<&HMACKey>,
) -> Result<Vec<u8>> {
    if let Some(key) = key {
        attributes.push(MessageIntegrity::new(key.clone()).into());
    }
    respond(request, MessageClass::SuccessResponse, attributes)
}

/// Builds and encodes an error response carrying `code`
pub fn error(
    request: &StunMessage,
    code: u16,
    reason: &str,
    mut attributes: Vec<StunAttribute>,
) -> Result<Vec<u8>> {
    let error_code = stun_rs::ErrorCode::new(code, reason)?;
    attributes.insert(0, ErrorCode::new(error_code).into());
    respond(request, MessageClass::ErrorResponse, attributes)
}

/// Builds the challenge sent with 401 and 438: the code, a nonce and the realm
pub fn challenge(request: &StunMessage, code: u16, nonce: &str, realm: &str) -> Result<Vec<u8>> {
    let attributes = vec![
        Nonce::try_from(nonce)?.into(),
        Realm::try_from(realm)?.into(),
    ];
    error(request, code, reason_phrase(code), attributes)
}

/// Builds a Data indication delivering `payload` from `peer`
pub fn data_indication(peer: SocketAddr, payload: &[u8]) -> Result<Vec<u8>> {
    let indication = StunMessageBuilder::new(DATA, MessageClass::Indication)
        .with_attribute(XorPeerAddress::from(peer))
        .with_attribute(Data::from(payload.to_vec()))
        .build();
    encode(&indication, payload.len())
}

fn respond(
    request: &StunMessage,
    class: MessageClass,
    attributes: Vec<StunAttribute>,
) -> Result<Vec<u8>> {
    let response = attributes
        .into_iter()
        .fold(
            StunMessageBuilder::new(request.method(), class)
                .with_transaction_id(*request.transaction_id()),
            |builder, attribute| builder.with_attribute(attribute),
        )
        .build();

    encode(&response, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::turn::test_util::{long_term_key, verify_integrity, RawMessage, BINDING};
    use stun_rs::{DecoderContextBuilder, MessageDecoderBuilder};

    fn request() -> StunMessage {
        let decoder = MessageDecoderBuilder::default()
            .with_context(DecoderContextBuilder::default().build())
            .build();
        let (message, _) = decoder.decode(&RawMessage::request(BINDING).build()).unwrap();
        message
    }

    #[test]
    fn test_success_signed_by_encoder() {
        let key = long_term_key("alice", "turn.example.com", "secret");

        let signed = success(&request(), vec![], Some(&key)).unwrap();
        assert!(verify_integrity(&signed, &key));
        assert!(!verify_integrity(
            &signed,
            &long_term_key("alice", "turn.example.com", "other")
        ));

        let unsigned = success(&request(), vec![], None).unwrap();
        assert!(!verify_integrity(&unsigned, &key));
    }
}
