use bytes::Bytes;

/// An application message: a data blob plus optional metadata.
///
/// The metadata distinguishes "absent" from "empty"; the wire carries that
/// distinction in the METADATA header flag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Payload {
    pub(crate) metadata: Option<Bytes>,
    pub(crate) data: Bytes,
}

impl Payload {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            metadata: None,
            data: data.into(),
        }
    }

    pub fn builder() -> PayloadBuilder {
        PayloadBuilder::default()
    }

    pub fn metadata(&self) -> Option<&Bytes> {
        self.metadata.as_ref()
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn split(self) -> (Option<Bytes>, Bytes) {
        (self.metadata, self.data)
    }

    pub fn is_empty(&self) -> bool {
        self.metadata.is_none() && self.data.is_empty()
    }

    /// Total number of payload bytes (metadata + data), ignoring framing.
    pub fn len(&self) -> usize {
        self.metadata.as_ref().map_or(0, Bytes::len) + self.data.len()
    }

    #[cfg(feature = "json")]
    pub fn from_json<T: serde::Serialize>(value: &T) -> serde_json::Result<Self> {
        Ok(Self::new(serde_json::to_vec(value)?))
    }

    #[cfg(feature = "json")]
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.data)
    }
}

impl From<Bytes> for Payload {
    fn from(data: Bytes) -> Self {
        Self::new(data)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

impl From<&'static str> for Payload {
    fn from(data: &'static str) -> Self {
        Self::new(Bytes::from_static(data.as_bytes()))
    }
}

#[derive(Debug, Default)]
pub struct PayloadBuilder {
    payload: Payload,
}

impl PayloadBuilder {
    pub fn set_metadata(mut self, metadata: impl Into<Bytes>) -> Self {
        self.payload.metadata = Some(metadata.into());
        self
    }

    pub fn set_data(mut self, data: impl Into<Bytes>) -> Self {
        self.payload.data = data.into();
        self
    }

    pub fn build(self) -> Payload {
        self.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_vs_empty_metadata() {
        let absent = Payload::new("x");
        let empty = Payload::builder()
            .set_data("x")
            .set_metadata(Bytes::new())
            .build();
        assert_ne!(absent, empty);
        assert!(absent.metadata().is_none());
        assert_eq!(empty.metadata().map(Bytes::len), Some(0));
    }

    #[test]
    fn len_counts_both_blobs() {
        let p = Payload::builder().set_metadata("meta").set_data("data!").build();
        assert_eq!(p.len(), 9);
        assert!(!p.is_empty());
        assert!(Payload::default().is_empty());
    }

    #[cfg(feature = "json")]
    #[test]
    fn json_round_trip() {
        let p = Payload::from_json(&serde_json::json!({"q": "ping"})).unwrap();
        let v: serde_json::Value = p.json().unwrap();
        assert_eq!(v["q"], "ping");
    }
}
