// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Message sanitization: strip image content when the resolved model does
//! not support image input.
//!
//! Call [`strip_images_if_unsupported`] after translating a dialect-specific
//! request into [`crate::types::Message`]s and before handing them to the
//! upstream payload builder.

use crate::types::Message;

const IMAGE_OMITTED: &str = "[image omitted: model does not support image input]";

/// Drop image parts from `messages`, replacing them with a text placeholder,
/// unless `supports_images` is true. A no-op when the model does support
/// images.
pub fn strip_images_if_unsupported(messages: Vec<Message>, supports_images: bool) -> Vec<Message> {
    if supports_images {
        return messages;
    }
    messages.into_iter().map(strip_message).collect()
}

fn strip_message(mut m: Message) -> Message {
    let Some(images) = m.images.take() else {
        return m;
    };
    if images.is_empty() {
        return m;
    }
    let placeholder = std::iter::repeat(IMAGE_OMITTED).take(images.len()).collect::<Vec<_>>().join(" ");
    m.text = match m.text.take() {
        Some(existing) if !existing.is_empty() => Some(format!("{existing}\n{placeholder}")),
        _ => Some(placeholder),
    };
    m
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ImagePart;

    fn with_image(text: &str) -> Message {
        Message::user(text).with_images(vec![ImagePart {
            media_type: "image/png".into(),
            data: "QUJD".into(),
        }])
    }

    #[test]
    fn no_op_when_images_supported() {
        let msg = with_image("describe this");
        let result = strip_images_if_unsupported(vec![msg], true);
        assert!(result[0].images.is_some());
    }

    #[test]
    fn strips_images_and_appends_placeholder() {
        let msg = with_image("describe this");
        let result = strip_images_if_unsupported(vec![msg], false);
        assert!(result[0].images.is_none());
        assert!(result[0].text.as_deref().unwrap().contains(IMAGE_OMITTED));
        assert!(result[0].text.as_deref().unwrap().starts_with("describe this"));
    }

    #[test]
    fn image_only_message_gets_bare_placeholder_text() {
        let msg = Message::user("").with_images(vec![ImagePart {
            media_type: "image/png".into(),
            data: "QUJD".into(),
        }]);
        let mut msg = msg;
        msg.text = None;
        let result = strip_images_if_unsupported(vec![msg], false);
        assert_eq!(result[0].text.as_deref(), Some(IMAGE_OMITTED));
    }

    #[test]
    fn messages_without_images_pass_through_unchanged() {
        let msgs = vec![Message::user("hello"), Message::assistant("world")];
        let result = strip_images_if_unsupported(msgs, false);
        assert_eq!(result[0].text.as_deref(), Some("hello"));
        assert_eq!(result[1].text.as_deref(), Some("world"));
    }
}
