//! The weighted-update codec.
//!
//! The codec binds a masking configuration to the schema of a model and converts between payload
//! files, encrypted states and plaintext parameter sets.

use std::path::Path;

use crate::{
    crypto::RoundKey,
    mask::{
        DecryptionError,
        EncryptedModelState,
        EncryptionError,
        MaskConfig,
        Masker,
        ParameterSchema,
        ParameterSet,
        Unmasker,
    },
    payload::{CorruptPayloadError, InboundPayload, OutboundPayload},
};

#[derive(Clone, Debug, PartialEq)]
/// Encrypts and decrypts parameter sets of a fixed schema.
pub struct Codec {
    config: MaskConfig,
    schema: ParameterSchema,
}

impl Codec {
    /// Creates a codec for the parameters of the given `schema`.
    pub fn new(config: MaskConfig, schema: ParameterSchema) -> Self {
        Self { config, schema }
    }

    /// Gets the masking configuration.
    pub fn config(&self) -> &MaskConfig {
        &self.config
    }

    /// Gets the parameter schema.
    pub fn schema(&self) -> &ParameterSchema {
        &self.schema
    }

    /// Gets the absolute bound of every plaintext value.
    pub fn bound(&self) -> f64 {
        self.config.bound() as f64
    }

    /// Reads an inbound payload and checks it against the schema.
    ///
    /// # Errors
    /// Fails if the payload is malformed in any way. No partial data is returned.
    pub fn unpack(&self, path: impl AsRef<Path>) -> Result<InboundPayload, CorruptPayloadError> {
        let payload = InboundPayload::read(path)?;
        payload.model_state.validate_schema(&self.schema)?;
        Ok(payload)
    }

    /// Reads an outbound payload and checks it against the schema.
    ///
    /// # Errors
    /// Fails if the payload is malformed in any way. No partial data is returned.
    pub fn unpack_outbound(
        &self,
        path: impl AsRef<Path>,
    ) -> Result<OutboundPayload, CorruptPayloadError> {
        let payload = OutboundPayload::read(path)?;
        payload.model_state.validate_schema(&self.schema)?;
        Ok(payload)
    }

    /// Removes the pairwise masks left in `state` and divides by `divisor`.
    ///
    /// # Errors
    /// Fails if the state does not belong to the round or the federation of the `key`, does not
    /// match the configuration or the schema, holds a pairwise mask the `key` doesn't know, the
    /// divisor is not positive and finite or the result is out of the representable range, which
    /// is what a wrong key yields.
    pub fn decrypt(
        &self,
        key: &RoundKey,
        state: EncryptedModelState,
        divisor: f64,
    ) -> Result<ParameterSet, DecryptionError> {
        Unmasker::new(self.config, key).unmask(&self.schema, state, divisor)
    }

    /// Decodes a `state` without any pairwise mask left and divides by `divisor`.
    ///
    /// This is how a coordinator reads a complete aggregate or a public encoding.
    ///
    /// # Errors
    /// Fails like [`decrypt()`], and if any pairwise mask is left in the state.
    ///
    /// [`decrypt()`]: Codec::decrypt
    pub fn decode(
        &self,
        state: EncryptedModelState,
        divisor: f64,
    ) -> Result<ParameterSet, DecryptionError> {
        Unmasker::without_key(self.config).unmask(&self.schema, state, divisor)
    }

    /// Masks `params` with the pairwise masks of the owner of the `key` in its round.
    ///
    /// # Errors
    /// Fails if the parameters don't match the schema, hold a non-finite value or a value beyond
    /// the bound of the configuration.
    pub fn encrypt(
        &self,
        key: &RoundKey,
        params: &ParameterSet,
    ) -> Result<EncryptedModelState, EncryptionError> {
        Masker::new(self.config, key).mask(&self.schema, params)
    }

    /// Embeds `params` without any mask.
    ///
    /// # Errors
    /// Fails for the same reasons as [`encrypt()`].
    ///
    /// [`encrypt()`]: Codec::encrypt
    pub fn encode_public(
        &self,
        round: u32,
        params: &ParameterSet,
    ) -> Result<EncryptedModelState, EncryptionError> {
        Masker::public(self.config, round).mask(&self.schema, params)
    }
}

#[cfg(test)]
mod tests {
    use ndarray::{ArrayD, IxDyn};
    use tempfile::TempDir;

    use super::*;
    use crate::{
        identity::ClientId,
        mask::SchemaError,
        testutils::round_keys,
        weight::rescale,
    };

    fn params(value: f32) -> ParameterSet {
        let mut params = ParameterSet::new();
        params.insert(
            "layer.weight".into(),
            ArrayD::from_shape_vec(IxDyn(&[2, 2]), vec![value, -value, 0.5 * value, 0.0]).unwrap(),
        );
        params.insert("layer.bias".into(), ArrayD::from_elem(IxDyn(&[2]), value));
        params
    }

    fn codec() -> Codec {
        Codec::new(MaskConfig::default(), ParameterSchema::of(&params(1.0)))
    }

    fn assert_close(expected: &ParameterSet, actual: &ParameterSet) {
        for (name, tensor) in expected {
            for (x, y) in tensor.iter().zip(actual[name].iter()) {
                assert!((x - y).abs() <= 1e-6 * x.abs().max(1.0), "{} != {}", x, y);
            }
        }
    }

    #[test]
    fn test_round_trip() {
        let codec = codec();
        let keys = round_keys(&["alice", "bob"], 0);
        let key = &keys[&ClientId::from("alice")];
        let params = params(0.123_456);
        let state = codec.encrypt(key, &params).unwrap();
        assert!(matches!(
            codec.decode(state.clone(), 1.0),
            Err(DecryptionError::MissingKey),
        ));
        let decrypted = codec.decrypt(key, state, 1.0).unwrap();
        assert_close(&params, &decrypted);
    }

    #[test]
    fn test_weight_preservation() {
        // N participants with weights w_i send w_i * x_i, the aggregate decrypts to the weighted
        // mean sum(w_i * x_i) / sum(w_i)
        let codec = codec();
        let keys = round_keys(&["a", "b", "c", "d"], 1);
        let contributions = [("a", 0.1, 3.0_f32), ("b", 0.2, -1.0), ("c", 0.3, 2.0), ("d", 0.4, 0.5)];

        let mut aggregation = crate::mask::Aggregation::new(*codec.config(), 1);
        let mut weight_sum = 0.0;
        let mut expected = 0.0;
        for (name, weight, value) in contributions.iter() {
            let weighted = rescale(params(*value), *weight);
            let state = codec
                .encrypt(&keys[&ClientId::from(*name)], &weighted)
                .unwrap();
            aggregation.aggregate(state).unwrap();
            weight_sum += weight;
            expected += weight * *value as f64;
        }
        let client_num = contributions.len() as u32;
        let decrypted = codec
            .decode(aggregation.into_state().unwrap(), client_num as f64)
            .unwrap();
        let global =
            crate::weight::global_model(decrypted, client_num, weight_sum, codec.bound()).unwrap();
        assert_close(&params(expected as f32), &global);
    }

    #[test]
    fn test_unpack() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("global.bin");
        let codec = codec();
        let payload = InboundPayload {
            model_state: codec.encode_public(0, &params(1.0)).unwrap(),
            weight_sum: 1.0,
            client_num: 1,
        };
        payload.write(&path).unwrap();
        assert_eq!(codec.unpack(&path).unwrap(), payload);

        let other = Codec::new(
            MaskConfig::default(),
            ParameterSchema::new(vec![("layer.weight", vec![4])]),
        );
        assert!(matches!(
            other.unpack(&path),
            Err(CorruptPayloadError::Schema(SchemaError::ShapeMismatch { .. })),
        ));
    }

    #[test]
    fn test_decrypt_with_wrong_key() {
        let codec = codec();
        let alice = ClientId::from("alice");
        let keys = round_keys(&["alice", "bob"], 0);
        let wrong_keys = round_keys(&["alice", "bob"], 0);
        let state = codec.encrypt(&keys[&alice], &params(0.5)).unwrap();
        assert!(matches!(
            codec.decrypt(&wrong_keys[&alice], state, 1.0),
            Err(DecryptionError::OutOfRange { .. }),
        ));
    }
}
