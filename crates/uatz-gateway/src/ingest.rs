use uatz_types::events::{MediaRef, MessageEvent};
use uatz_types::models::{MediaType, StoredMessage};

use crate::client::ProtocolClient;
use crate::error::{GatewayError, Result};

const TEXT_PLAIN: &str = "text/plain";

/// Normalizes one inbound message event. Media payloads are downloaded
/// through `client`; a failed download fails the conversion.
pub async fn convert_event(event: &MessageEvent, client: &dyn ProtocolClient) -> Result<StoredMessage> {
    let payload = event.message.as_ref().ok_or(GatewayError::UnrecognizedMessage)?;
    let mut msg = base_message(event);

    if let Some(image) = &payload.image_message {
        msg.text = image.caption.clone().unwrap_or_default();
        attach_media(&mut msg, MediaType::Image, image, client).await?;
    } else if let Some(video) = &payload.video_message {
        attach_media(&mut msg, MediaType::Video, video, client).await?;
    } else if let Some(audio) = &payload.audio_message {
        // No transcription yet: voice notes arrive with empty text.
        attach_media(&mut msg, MediaType::Audio, audio, client).await?;
    } else if let Some(sticker) = &payload.sticker_message {
        attach_media(&mut msg, MediaType::Sticker, sticker, client).await?;
    } else if let Some(document) = &payload.document_message {
        attach_media(&mut msg, MediaType::Document, document, client).await?;
    } else if let Some(text) = &payload.conversation {
        msg.media_type = MediaType::Text;
        msg.text = text.clone();
        msg.content_mime_type = TEXT_PLAIN.into();
    } else if let Some(extended) = &payload.extended_text_message {
        msg.media_type = MediaType::Text;
        msg.text = extended.text.clone().unwrap_or_default();
        msg.content_mime_type = TEXT_PLAIN.into();
    } else {
        msg.media_type = MediaType::Unknown;
        msg.text = serde_json::to_string(payload).unwrap_or_default();
        msg.content_mime_type = TEXT_PLAIN.into();
    }

    Ok(msg)
}

fn base_message(event: &MessageEvent) -> StoredMessage {
    let info = &event.info;
    StoredMessage {
        message_id: info.id.clone(),
        jid: String::new(),
        sender_id: info.sender.clone(),
        recipient_id: info.chat.clone(),
        is_from_me: info.is_from_me,
        is_from_group: info.is_group,
        media_type: MediaType::Unknown,
        text: String::new(),
        content: Vec::new(),
        content_mime_type: String::new(),
        recipient_name: info.push_name.clone(),
        timestamp: info.timestamp,
    }
}

async fn attach_media(
    msg: &mut StoredMessage,
    media_type: MediaType,
    media: &MediaRef,
    client: &dyn ProtocolClient,
) -> Result<()> {
    msg.media_type = media_type;
    msg.content_mime_type = media.mimetype.clone().unwrap_or_default();
    msg.content = client.download(media).await.map_err(GatewayError::Download)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeClient, info, text_event};
    use uatz_types::events::{ExtendedText, MessagePayload};

    fn event(payload: MessagePayload) -> MessageEvent {
        MessageEvent {
            info: info("MSG1", "5511999"),
            message: Some(payload),
        }
    }

    fn media(path: &str, mime: &str) -> MediaRef {
        MediaRef {
            direct_path: path.to_string(),
            mimetype: Some(mime.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn plain_text() {
        let client = FakeClient::paired("5500@s.whatsapp.net");
        let msg = convert_event(&text_event("A1", "5511999", "hello"), client.as_ref())
            .await
            .unwrap();

        assert_eq!(msg.media_type, MediaType::Text);
        assert_eq!(msg.text, "hello");
        assert_eq!(msg.content_mime_type, "text/plain");
        assert_eq!(msg.message_id, "A1");
        assert_eq!(msg.recipient_id, "5511999");
        assert_eq!(msg.recipient_name, "Maria");
        assert!(msg.content.is_empty());
    }

    #[tokio::test]
    async fn extended_text() {
        let client = FakeClient::paired("5500@s.whatsapp.net");
        let msg = convert_event(
            &event(MessagePayload {
                extended_text_message: Some(ExtendedText { text: Some("quoted reply".into()) }),
                ..Default::default()
            }),
            client.as_ref(),
        )
        .await
        .unwrap();

        assert_eq!(msg.media_type, MediaType::Text);
        assert_eq!(msg.text, "quoted reply");
    }

    #[tokio::test]
    async fn image_downloads_and_keeps_caption() {
        let client = FakeClient::paired("5500@s.whatsapp.net");
        client.put_media("/v/img", b"\xff\xd8jpeg");

        let mut image = media("/v/img", "image/jpeg");
        image.caption = Some("look".into());
        let msg = convert_event(
            &event(MessagePayload { image_message: Some(image), ..Default::default() }),
            client.as_ref(),
        )
        .await
        .unwrap();

        assert_eq!(msg.media_type, MediaType::Image);
        assert_eq!(msg.text, "look");
        assert_eq!(msg.content_mime_type, "image/jpeg");
        assert_eq!(msg.content, b"\xff\xd8jpeg");
    }

    #[tokio::test]
    async fn image_takes_precedence_over_text() {
        let client = FakeClient::paired("5500@s.whatsapp.net");
        client.put_media("/v/img", b"img");

        let msg = convert_event(
            &event(MessagePayload {
                image_message: Some(media("/v/img", "image/png")),
                conversation: Some("ignored".into()),
                ..Default::default()
            }),
            client.as_ref(),
        )
        .await
        .unwrap();
        assert_eq!(msg.media_type, MediaType::Image);
    }

    #[tokio::test]
    async fn audio_has_empty_text() {
        let client = FakeClient::paired("5500@s.whatsapp.net");
        client.put_media("/v/ogg", b"ogg");

        let msg = convert_event(
            &event(MessagePayload {
                audio_message: Some(media("/v/ogg", "audio/ogg; codecs=opus")),
                ..Default::default()
            }),
            client.as_ref(),
        )
        .await
        .unwrap();

        assert_eq!(msg.media_type, MediaType::Audio);
        assert_eq!(msg.text, "");
        assert_eq!(msg.content_mime_type, "audio/ogg; codecs=opus");
    }

    #[tokio::test]
    async fn failed_download_propagates() {
        let client = FakeClient::paired("5500@s.whatsapp.net");
        let err = convert_event(
            &event(MessagePayload {
                document_message: Some(media("/v/missing", "application/pdf")),
                ..Default::default()
            }),
            client.as_ref(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, GatewayError::Download(_)));
    }

    #[tokio::test]
    async fn unmodelled_payload_is_unknown() {
        let client = FakeClient::paired("5500@s.whatsapp.net");
        let payload: MessagePayload =
            serde_json::from_str(r#"{"reactionMessage":{"text":"+1"}}"#).unwrap();

        let msg = convert_event(&event(payload), client.as_ref()).await.unwrap();
        assert_eq!(msg.media_type, MediaType::Unknown);
        assert!(msg.text.contains("reactionMessage"));
        assert_eq!(msg.content_mime_type, "text/plain");
    }

    #[tokio::test]
    async fn missing_payload_is_an_error() {
        let client = FakeClient::paired("5500@s.whatsapp.net");
        let evt = MessageEvent { info: info("X", "5511"), message: None };

        let err = convert_event(&evt, client.as_ref()).await.unwrap_err();
        assert!(matches!(err, GatewayError::UnrecognizedMessage));
    }
}
