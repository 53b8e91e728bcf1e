// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire encoding of controller and satellite messages

use crate::messages::{ControllerMsg, SatelliteMsg};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SerializeError {
    #[error("failed to encode {kind} message")]
    Encode {
        kind: &'static str,
        #[source]
        err: serde_json::Error,
    },

    #[error("failed to decode message")]
    Decode(#[source] serde_json::Error),

    /// Encoding succeeded but produced nothing to send
    #[error("encoding {kind} message produced an empty payload")]
    EmptyPayload { kind: &'static str },
}

pub trait MessageSerializer: Send + Sync {
    fn encode_satellite_msg(
        &self,
        msg: &SatelliteMsg,
    ) -> Result<Vec<u8>, SerializeError>;

    fn decode_satellite_msg(
        &self,
        bytes: &[u8],
    ) -> Result<SatelliteMsg, SerializeError>;

    fn encode_controller_msg(
        &self,
        msg: &ControllerMsg,
    ) -> Result<Vec<u8>, SerializeError>;

    fn decode_controller_msg(
        &self,
        bytes: &[u8],
    ) -> Result<ControllerMsg, SerializeError>;
}

/// Encodes messages as JSON documents
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonSerializer;

impl JsonSerializer {
    fn encode<T: serde::Serialize>(
        kind: &'static str,
        msg: &T,
    ) -> Result<Vec<u8>, SerializeError> {
        let bytes = serde_json::to_vec(msg)
            .map_err(|err| SerializeError::Encode { kind, err })?;
        if bytes.is_empty() {
            return Err(SerializeError::EmptyPayload { kind });
        }
        Ok(bytes)
    }
}

impl MessageSerializer for JsonSerializer {
    fn encode_satellite_msg(
        &self,
        msg: &SatelliteMsg,
    ) -> Result<Vec<u8>, SerializeError> {
        Self::encode(msg.kind(), msg)
    }

    fn decode_satellite_msg(
        &self,
        bytes: &[u8],
    ) -> Result<SatelliteMsg, SerializeError> {
        serde_json::from_slice(bytes).map_err(SerializeError::Decode)
    }

    fn encode_controller_msg(
        &self,
        msg: &ControllerMsg,
    ) -> Result<Vec<u8>, SerializeError> {
        Self::encode(msg.kind(), msg)
    }

    fn decode_controller_msg(
        &self,
        bytes: &[u8],
    ) -> Result<ControllerMsg, SerializeError> {
        serde_json::from_slice(bytes).map_err(SerializeError::Decode)
    }
}
