use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::JobError;

/// The wire shape every job message must have: a JSON object with a string
/// `type` naming the job, plus that job's fields.
///
/// ```json
/// {"type": "capture_payment", "payment_id": "pay_123", "amount_cents": 4200}
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobEnvelope {
    #[serde(rename = "type")]
    pub job_type: String,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl JobEnvelope {
    /// Wraps a typed payload. The payload must serialize to a JSON object
    /// (or unit, for jobs without fields) and must not have its own `type`.
    pub fn new<P: Serialize>(job_type: impl Into<String>, payload: &P) -> anyhow::Result<Self> {
        let payload = match serde_json::to_value(payload)? {
            Value::Object(fields) => fields,
            Value::Null => Map::new(),
            other => anyhow::bail!("job payload must be a JSON object, got {other}"),
        };
        anyhow::ensure!(
            !payload.contains_key("type"),
            "job payload must not contain a `type` field"
        );
        Ok(Self {
            job_type: job_type.into(),
            payload,
        })
    }

    /// Parses a message body. Anything that is not a JSON object with a
    /// string `type` is malformed.
    pub fn parse(body: &[u8]) -> Result<Self, JobError> {
        serde_json::from_slice(body).map_err(JobError::malformed)
    }

    /// Deserializes the fields into a handler's payload type. A mismatch is
    /// malformed as well.
    pub fn payload_as<P: DeserializeOwned>(&self) -> Result<P, JobError> {
        serde_json::from_value(Value::Object(self.payload.clone())).map_err(|e| {
            JobError::malformed(format!("payload of `{}` job: {e}", self.job_type))
        })
    }

    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct CapturePayment {
        payment_id: String,
        amount_cents: u64,
    }

    #[test]
    fn parses_type_and_payload() {
        let envelope = JobEnvelope::parse(
            br#"{"type":"capture_payment","payment_id":"pay_1","amount_cents":4200}"#,
        )
        .unwrap();
        assert_eq!("capture_payment", envelope.job_type);
        assert_eq!(
            CapturePayment {
                payment_id: "pay_1".into(),
                amount_cents: 4200
            },
            envelope.payload_as::<CapturePayment>().unwrap()
        );
    }

    #[test]
    fn rejects_bodies_without_a_string_type() {
        let bodies: [&[u8]; 5] = [
            b"not json",
            br#"["capture_payment"]"#,
            br#"{"payment_id":"pay_1"}"#,
            br#"{"type":7}"#,
            b"",
        ];
        for body in bodies {
            assert!(
                matches!(JobEnvelope::parse(body), Err(JobError::Malformed { .. })),
                "{}",
                String::from_utf8_lossy(body)
            );
        }
    }

    #[test]
    fn payload_shape_mismatch_is_malformed() {
        let envelope =
            JobEnvelope::parse(br#"{"type":"capture_payment","payment_id":42}"#).unwrap();
        assert!(matches!(
            envelope.payload_as::<CapturePayment>(),
            Err(JobError::Malformed { .. })
        ));
    }

    #[test]
    fn new_rejects_non_object_payloads() {
        assert!(JobEnvelope::new("warm_cache", &vec!["a", "b"]).is_err());
        assert!(JobEnvelope::new("noop", &()).unwrap().payload.is_empty());

        let envelope = JobEnvelope::new(
            "capture_payment",
            &CapturePayment {
                payment_id: "pay_9".into(),
                amount_cents: 1,
            },
        )
        .unwrap();
        let reparsed = JobEnvelope::parse(&envelope.to_bytes().unwrap()).unwrap();
        assert_eq!(envelope, reparsed);
    }
}
