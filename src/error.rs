// Copyright (c) 2023 The TQUIC Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Error type for chunk transfer operations.

use strum_macros::EnumIter;

/// Chunk transfer error.
#[derive(Clone, Debug, PartialEq, Eq, EnumIter)]
pub enum Error {
    /// The provided buffer is too short.
    BufferTooShort,

    /// The provided packet cannot be parsed.
    InvalidPacket,

    /// The requested segment is outside of the chunk.
    InvalidSegment(u32),

    /// The chunk is not held by this peer.
    UnknownChunk(String),

    /// The chunk data does not match its digest, or has a wrong size.
    InvalidChunk(String),

    /// The operation cannot be completed because it was attempted in an
    /// invalid state.
    InvalidState(String),

    /// The configuration is invalid.
    InvalidConfig(String),

    /// I/O error.
    IoError(String),
}

impl Error {
    /// Whether the error is caused by a malformed datagram from the network.
    ///
    /// Such errors are never fatal: the datagram is dropped.
    pub fn is_malformed(&self) -> bool {
        matches!(self, Error::BufferTooShort | Error::InvalidPacket)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

impl std::convert::From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IoError(format!("{}", err))
    }
}

impl std::convert::From<hex::FromHexError> for Error {
    fn from(err: hex::FromHexError) -> Self {
        Error::InvalidConfig(format!("bad digest: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn malformed_errors() {
        for err in Error::iter() {
            let malformed = err == Error::BufferTooShort || err == Error::InvalidPacket;
            assert_eq!(err.is_malformed(), malformed, "{}", err);
        }
    }

    #[test]
    fn io_error() {
        use std::error::Error;
        let e = std::io::Error::from(std::io::ErrorKind::UnexpectedEof);
        let e = super::Error::from(e);

        assert_eq!(format!("{}", e), "IoError(\"unexpected end of file\")");
        assert!(e.source().is_none());
    }

    #[test]
    fn hex_error() {
        let e = super::Error::from(hex::FromHexError::OddLength);
        assert!(matches!(e, super::Error::InvalidConfig(_)));
    }
}
