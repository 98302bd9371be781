//! The [`Envelope`], the unit of data that replicas and clients hand to the network.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::{pbft::messages::PbftMessage, types::request::Request};

/// Discriminates client traffic from replica-to-replica traffic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum EnvelopeKind {
    /// The payload is a Borsh-encoded [`Request`] submitted by a client.
    ClientRequest,

    /// The payload is a Borsh-encoded [`PbftMessage`].
    Consensus,
}

/// A message type discriminator and an encoded payload.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Wrap a request submitted by a client.
    pub fn client_request(request: &Request) -> Envelope {
        Envelope {
            kind: EnvelopeKind::ClientRequest,
            // Safety: serializing into a Vec<u8> cannot fail.
            payload: request.try_to_vec().unwrap(),
        }
    }

    /// Wrap a protocol message.
    pub fn consensus(message: &PbftMessage) -> Envelope {
        Envelope {
            kind: EnvelopeKind::Consensus,
            // Safety: serializing into a Vec<u8> cannot fail.
            payload: message.try_to_vec().unwrap(),
        }
    }

    /// Decode the payload. A client request decodes into [`PbftMessage::Request`].
    pub fn decode(&self) -> Result<PbftMessage, std::io::Error> {
        match self.kind {
            EnvelopeKind::ClientRequest => {
                Request::try_from_slice(&self.payload).map(PbftMessage::Request)
            }
            EnvelopeKind::Consensus => PbftMessage::try_from_slice(&self.payload),
        }
    }
}

impl From<PbftMessage> for Envelope {
    fn from(value: PbftMessage) -> Self {
        Envelope::consensus(&value)
    }
}
