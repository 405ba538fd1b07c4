//! vCard payloads (XEP-0054)
//!
//! The vCard element is a flat bag of uppercase-named fields with a couple
//! of nested structures; this module maps the subset the client surfaces
//! into a typed record and back.

use serde::{Deserialize, Serialize};

use crate::stanza::{ns, Element};

// ----------------------------------------------------------------------------
// vCard Model
// ----------------------------------------------------------------------------

/// Avatar photo carried inside a vCard
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VcardPhoto {
    /// MIME type of the encoded image
    pub mime_type: Option<String>,
    /// Base64-encoded image data, exactly as carried on the wire
    pub data_b64: String,
    /// SHA-1 digest of the decoded image, when already known
    pub digest: Option<String>,
}

/// Typed vCard record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vcard {
    pub full_name: Option<String>,
    pub nickname: Option<String>,
    pub url: Option<String>,
    pub birthday: Option<String>,
    pub description: Option<String>,
    pub emails: Vec<String>,
    pub phones: Vec<String>,
    pub photo: Option<VcardPhoto>,
}

impl Vcard {
    /// Whether no field is set
    pub fn is_empty(&self) -> bool {
        *self == Vcard::default()
    }

    /// Parse a `<vCard/>` element
    pub fn from_element(vcard: &Element) -> Self {
        let mut out = Vcard::default();
        for field in vcard.children() {
            match field.name() {
                "FN" => out.full_name = non_empty(field.text()),
                "NICKNAME" => out.nickname = non_empty(field.text()),
                "URL" => out.url = non_empty(field.text()),
                "BDAY" => out.birthday = non_empty(field.text()),
                "DESC" => out.description = non_empty(field.text()),
                "EMAIL" => {
                    if let Some(userid) = field.child_text("USERID").and_then(non_empty) {
                        out.emails.push(userid);
                    }
                }
                "TEL" => {
                    if let Some(number) = field.child_text("NUMBER").and_then(non_empty) {
                        out.phones.push(number);
                    }
                }
                "PHOTO" => {
                    if let Some(data) = field.child_text("BINVAL").and_then(non_empty) {
                        out.photo = Some(VcardPhoto {
                            mime_type: field.child_text("TYPE").and_then(non_empty),
                            data_b64: data,
                            digest: field.child_text("SHA").and_then(non_empty),
                        });
                    }
                }
                _ => {}
            }
        }
        out
    }

    /// Build the `<vCard/>` element for publishing
    pub fn to_element(&self) -> Element {
        let mut vcard = Element::new("vCard").with_namespace(ns::VCARD);
        if let Some(v) = &self.full_name {
            vcard.push_child(Element::new("FN").with_text(v.clone()));
        }
        if let Some(v) = &self.nickname {
            vcard.push_child(Element::new("NICKNAME").with_text(v.clone()));
        }
        if let Some(v) = &self.url {
            vcard.push_child(Element::new("URL").with_text(v.clone()));
        }
        if let Some(v) = &self.birthday {
            vcard.push_child(Element::new("BDAY").with_text(v.clone()));
        }
        if let Some(v) = &self.description {
            vcard.push_child(Element::new("DESC").with_text(v.clone()));
        }
        for email in &self.emails {
            vcard.push_child(
                Element::new("EMAIL").with_child(Element::new("USERID").with_text(email.clone())),
            );
        }
        for phone in &self.phones {
            vcard.push_child(
                Element::new("TEL").with_child(Element::new("NUMBER").with_text(phone.clone())),
            );
        }
        if let Some(photo) = &self.photo {
            let mut el = Element::new("PHOTO");
            if let Some(mime) = &photo.mime_type {
                el.push_child(Element::new("TYPE").with_text(mime.clone()));
            }
            el.push_child(Element::new("BINVAL").with_text(photo.data_b64.clone()));
            if let Some(digest) = &photo.digest {
                el.push_child(Element::new("SHA").with_text(digest.clone()));
            }
            vcard.push_child(el);
        }
        vcard
    }
}

fn non_empty(text: &str) -> Option<String> {
    if text.is_empty() {
        None
    } else {
        Some(text.to_owned())
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vcard_roundtrip() {
        let card = Vcard {
            full_name: Some("Alice Example".into()),
            nickname: Some("alice".into()),
            emails: vec!["alice@example.com".into()],
            phones: vec!["+1555".into()],
            photo: Some(VcardPhoto {
                mime_type: Some("image/png".into()),
                data_b64: "aGVsbG8=".into(),
                digest: None,
            }),
            ..Vcard::default()
        };

        let parsed = Vcard::from_element(&card.to_element());
        assert_eq!(parsed, card);
    }

    #[test]
    fn test_empty_vcard() {
        let el = Element::new("vCard").with_namespace(ns::VCARD);
        let parsed = Vcard::from_element(&el);
        assert!(parsed.is_empty());
    }

    #[test]
    fn test_vcard_ignores_unknown_fields() {
        let el = Element::new("vCard")
            .with_namespace(ns::VCARD)
            .with_child(Element::new("FN").with_text("Bob"))
            .with_child(Element::new("X-CUSTOM").with_text("ignored"));
        let parsed = Vcard::from_element(&el);
        assert_eq!(parsed.full_name.as_deref(), Some("Bob"));
    }
}
