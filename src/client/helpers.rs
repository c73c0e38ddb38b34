//! One-shot conveniences: each connects with a clean session, performs a
//! single operation and disconnects.

use bytes::Bytes;

use crate::message::Message;
use crate::packet::QoS;

use super::{Client, ClientError, ConnectOptions};

/// Connect and disconnect once with a clean session request, forcing the
/// broker to reset the client's session. Useful when it's not clear in what
/// state the last session was left.
pub async fn clear_session(url: &str, mut options: ConnectOptions) -> Result<(), ClientError> {
    options.clean_session = true;

    let (client, _messages) = Client::connect_url(url, options).await?;

    client.disconnect().await
}

/// Send an empty retained message, clearing whatever was retained on the
/// topic. Useful when it's not clear whether a message has been retained.
pub async fn clear_retained(
    url: &str,
    mut options: ConnectOptions,
    topic: &str,
) -> Result<(), ClientError> {
    options.clean_session = true;

    let (client, _messages) = Client::connect_url(url, options).await?;

    client
        .publish(topic, Bytes::new(), QoS::AtMostOnce, true)
        .await?;

    client.disconnect().await
}

/// Publish a single message and disconnect.
pub async fn publish_message(
    url: &str,
    mut options: ConnectOptions,
    message: Message,
) -> Result<(), ClientError> {
    options.clean_session = true;

    let (client, _messages) = Client::connect_url(url, options).await?;

    client.publish_message(message).await?;

    client.disconnect().await
}

/// Subscribe to a filter and wait for the first matching message.
///
/// Message and error delivery share the buffered stream, so a connection
/// failure surfaces as an error here rather than wedging the call.
pub async fn receive_message(
    url: &str,
    mut options: ConnectOptions,
    filter: &str,
    qos: QoS,
) -> Result<Message, ClientError> {
    options.clean_session = true;

    let (client, mut messages) = Client::connect_url(url, options).await?;

    client.subscribe(filter, qos).await?;

    let message = messages.recv().await.ok_or(ClientError::Closed)?;

    client.disconnect().await?;

    Ok(message)
}
