//! Outgoing mail and delivery receipts.

/// An outgoing message. At least one recipient and one body (text or
/// html) are required; the transport rejects anything less.
#[derive(Debug, Clone, Default)]
pub struct Mail {
    pub to: Vec<String>,
    pub subject: String,
    pub text: Option<String>,
    pub html: Option<String>,
    pub reply_to: Option<String>,
}

impl Mail {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            ..Self::default()
        }
    }

    pub fn to(mut self, address: impl Into<String>) -> Self {
        self.to.push(address.into());
        self
    }

    pub fn text(mut self, body: impl Into<String>) -> Self {
        self.text = Some(body.into());
        self
    }

    pub fn html(mut self, body: impl Into<String>) -> Self {
        self.html = Some(body.into());
        self
    }

    pub fn reply_to(mut self, address: impl Into<String>) -> Self {
        self.reply_to = Some(address.into());
        self
    }

    pub fn has_body(&self) -> bool {
        self.text.is_some() || self.html.is_some()
    }
}

/// What the server accepted.
#[derive(Debug, Clone)]
pub struct DeliveryReceipt {
    /// Message id assigned by the server, or a generated one when the
    /// server did not report any
    pub message_id: String,
    pub accepted: Vec<String>,
    pub rejected: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_accumulates_recipients() {
        let mail = Mail::new("hello")
            .to("a@example.com")
            .to("b@example.com")
            .text("hi");
        assert_eq!(mail.to.len(), 2);
        assert_eq!(mail.subject, "hello");
        assert!(mail.has_body());
    }

    #[test]
    fn empty_mail_has_no_body() {
        assert!(!Mail::new("x").has_body());
    }
}
