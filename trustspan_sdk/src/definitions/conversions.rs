use bytes::BytesMut;

use super::ReceivedMessage;

impl<T: AsRef<[u8]>> ReceivedMessage<T> {
    /// Turn a ReceivedMessage that contains references to borrowed data into a
    /// freestanding version; if it already was freestanding, nothing happens.
    pub fn into_owned(self) -> ReceivedMessage
    where
        T: Into<BytesMut>,
    {
        self.converted()
    }

    /// Convert the data representation used by a ReceivedMessage; we are careful
    /// with the payload data since it may be very large.
    pub(crate) fn converted<U>(self) -> ReceivedMessage<U>
    where
        U: AsRef<[u8]>,
        T: Into<U>,
    {
        use ReceivedMessage::*;
        match self {
            GenericMessage {
                sender,
                receiver,
                nonconfidential_data,
                message,
                message_type,
            } => GenericMessage {
                sender,
                receiver,
                nonconfidential_data: nonconfidential_data.map(|x| x.into()),
                message: message.into(),
                message_type,
            },
            RequestRelationship {
                sender,
                receiver,
                route,
                nested_vid,
                thread_id,
            } => RequestRelationship {
                sender,
                receiver,
                route,
                nested_vid,
                thread_id,
            },
            AcceptRelationship {
                sender,
                receiver,
                nested_vid,
            } => AcceptRelationship {
                sender,
                receiver,
                nested_vid,
            },
            CancelRelationship { sender, receiver } => CancelRelationship { sender, receiver },
            ForwardRequest {
                sender,
                receiver,
                next_hop,
                route,
                opaque_payload,
            } => ForwardRequest {
                sender,
                receiver,
                next_hop,
                route,
                opaque_payload,
            },
            PendingMessage {
                unknown_vid,
                payload,
            } => PendingMessage {
                unknown_vid,
                payload,
            },
        }
    }
}
