use std::fmt;

use serde::{Deserialize, Serialize, de::DeserializeOwned};

/// Kind discriminant carried by every record.
///
/// `Invalid` is the zero value of the wire enum. Decoding a kind that is not
/// in this set fails outright; a record that omits the field decodes to
/// `Invalid` and is rejected by policy at the session layer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MsgKind {
    #[default]
    Invalid,
    Ack,
    Nack,
    Logon,
    Logoff,
    Subscribe,
    Unsubscribe,
    Custom,
}

impl fmt::Display for MsgKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MsgKind::Invalid => "INVALID",
            MsgKind::Ack => "ACK",
            MsgKind::Nack => "NACK",
            MsgKind::Logon => "LOGON",
            MsgKind::Logoff => "LOGOFF",
            MsgKind::Subscribe => "SUBSCRIBE",
            MsgKind::Unsubscribe => "UNSUBSCRIBE",
            MsgKind::Custom => "CUSTOM",
        };
        f.write_str(s)
    }
}

/// The application message carried in every non-heartbeat frame.
///
/// All fields default when absent, so decoders tolerate both older senders
/// (missing fields) and newer ones (unknown fields are skipped).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Record {
    pub msg_type: MsgKind,
    /// Monotonic per-sender id, allocated starting at 1.
    pub msg_key: u32,
    /// Key of the message this record replies to; 0 if not a reply.
    pub reply_msg_key: u32,
    /// Piggybacked acknowledgements of previously received keys.
    pub ack_keys: Vec<u32>,
    pub orig_client_type: u32,
    pub orig_client_id: u32,
    pub dest_client_type: u32,
    pub dest_client_id: u32,
    pub topic: u32,
    pub is_archived: bool,
    /// Opaque sub-message; interpretation depends on `msg_type`.
    #[serde(with = "serde_bytes_vec")]
    pub payload: Vec<u8>,
}

impl Record {
    /// Acknowledgement echoing the key of `msg`, addressed back to its origin.
    pub fn ack_for(msg: &Record) -> Record {
        Record {
            msg_type: MsgKind::Ack,
            msg_key: msg.msg_key,
            dest_client_type: msg.orig_client_type,
            dest_client_id: msg.orig_client_id,
            ..Record::default()
        }
    }

    /// Negative acknowledgement for `msg` carrying a reason and free-form detail.
    pub fn nack_for(msg: &Record, reason: u32, details: &str) -> Record {
        Record {
            msg_type: MsgKind::Nack,
            msg_key: msg.msg_key,
            dest_client_type: msg.orig_client_type,
            dest_client_id: msg.orig_client_id,
            payload: NackBody { reason, details: details.to_owned() }.to_payload(),
            ..Record::default()
        }
    }

    /// Decode the typed sub-message out of `payload`.
    pub fn body<B: DeserializeOwned>(&self) -> Option<B> {
        serde_json::from_slice(&self.payload).ok()
    }

    /// True when the record names a specific destination client.
    #[inline]
    pub fn is_directed(&self) -> bool {
        self.dest_client_type > 0
    }
}

/// Sub-message of LOGON records and of the synthesized LOGON/LOGOFF notices
/// the broker fans out on behalf of a client.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogonBody {
    pub client_type: u32,
    pub client_id: u32,
}

/// Sub-message of SUBSCRIBE and UNSUBSCRIBE records.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubscribeBody {
    pub client_type: u32,
    pub client_id: u32,
    pub topic: u32,
}

/// Sub-message of NACK records.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NackBody {
    pub reason: u32,
    pub details: String,
}

macro_rules! impl_to_payload {
    ($($body:ty),*) => {$(
        impl $body {
            /// Serialize into `Record::payload` bytes.
            pub fn to_payload(&self) -> Vec<u8> {
                serde_json::to_vec(self).expect("body serialization is infallible")
            }
        }
    )*};
}
impl_to_payload!(LogonBody, SubscribeBody, NackBody);

/// Compact byte-string encoding for the payload field so it does not bloat
/// into a JSON integer array.
mod serde_bytes_vec {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&bytes.iter().map(|b| char::from(*b)).collect::<String>())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        s.chars()
            .map(|c| u8::try_from(u32::from(c)).map_err(serde::de::Error::custom))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_echoes_key_and_targets_origin() {
        let mut msg = Record { msg_type: MsgKind::Custom, msg_key: 9, ..Record::default() };
        msg.orig_client_type = 2;
        msg.orig_client_id = 200;

        let ack = Record::ack_for(&msg);
        assert_eq!(ack.msg_type, MsgKind::Ack);
        assert_eq!(ack.msg_key, 9);
        assert_eq!(ack.dest_client_type, 2);
        assert_eq!(ack.dest_client_id, 200);
    }

    #[test]
    fn nack_carries_reason_and_details() {
        let msg = Record { msg_key: 3, orig_client_type: 1, ..Record::default() };
        let nack = Record::nack_for(&msg, 42, "no such object");
        let body: NackBody = nack.body().unwrap();
        assert_eq!(body.reason, 42);
        assert_eq!(body.details, "no such object");
    }

    #[test]
    fn missing_fields_default_and_unknown_fields_are_skipped() {
        let decoded: Record =
            serde_json::from_str(r#"{"msg_type":"LOGON","msg_key":7,"future_field":true}"#)
                .unwrap();
        assert_eq!(decoded.msg_type, MsgKind::Logon);
        assert_eq!(decoded.msg_key, 7);
        assert_eq!(decoded.reply_msg_key, 0);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn unknown_kind_fails_to_decode() {
        assert!(serde_json::from_str::<Record>(r#"{"msg_type":"REWIND"}"#).is_err());
    }

    #[test]
    fn payload_bytes_roundtrip() {
        let body = SubscribeBody { client_type: 2, client_id: 0, topic: 5 };
        let rec = Record { payload: body.to_payload(), ..Record::default() };
        let bytes = serde_json::to_vec(&rec).unwrap();
        let back: Record = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.body::<SubscribeBody>().unwrap(), body);
    }
}
