use crate::{
    submission::ValidSubmission,
    transport::{MessageBody, OutboundMessage},
};
use lettre::message::Mailbox;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tinytemplate::{format, format_unescaped, TinyTemplate};
use tracing::warn;

const NOTIFICATION_TEMPLATE_NAME: &str = "notification";
const ACKNOWLEDGEMENT_TEMPLATE_NAME: &str = "acknowledgement";
const NOTIFICATION_TEMPLATE: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/assets/notification.html"
));
const ACKNOWLEDGEMENT_TEMPLATE: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/assets/acknowledgement.txt"
));

const NOTIFICATION_SUBJECT: &str = "New inquiry from website";
const ACKNOWLEDGEMENT_SUBJECT: &str = "Thank you for your inquiry";

/// Turns valid submissions into mail from the configured sender to the configured recipients.
#[derive(Debug)]
pub struct MessageComposer {
    sender: String,
    recipients: Vec<String>,
    send_acknowledgement: bool,
}

#[derive(Serialize)]
struct Context<'a> {
    name: &'a str,
    phone: &'a str,
    email: &'a str,
    service: &'a str,
    address: &'a str,
    requested_date: &'a str,
    note: &'a str,
}

impl<'a> Context<'a> {
    fn new(submission: &'a ValidSubmission) -> Self {
        Self {
            name: &submission.name,
            phone: &submission.phone,
            email: submission.reply_to().unwrap_or("-"),
            service: &submission.service,
            address: &submission.address,
            requested_date: &submission.requested_date,
            note: &submission.note,
        }
    }
}

impl MessageComposer {
    pub fn new(
        sender: String,
        recipients: Vec<String>,
        send_acknowledgement: bool,
    ) -> Result<Self, ComposeError> {
        if recipients.is_empty() {
            return Err(ComposeError::NoRecipients);
        }
        Ok(Self {
            sender,
            recipients,
            send_acknowledgement,
        })
    }

    /// The message to the site owners. Every user supplied value is HTML escaped.
    pub fn notification(
        &self,
        submission: &ValidSubmission,
    ) -> Result<OutboundMessage, ComposeError> {
        let mut tt = TinyTemplate::new();
        tt.add_formatter("line_breaks", render_line_breaks);
        tt.add_template(NOTIFICATION_TEMPLATE_NAME, NOTIFICATION_TEMPLATE)?;
        let body = tt.render(NOTIFICATION_TEMPLATE_NAME, &Context::new(submission))?;
        let subject = match submission.service() {
            Some(service) => format!("New inquiry: {service}"),
            None => NOTIFICATION_SUBJECT.into(),
        };
        Ok(OutboundMessage {
            sender: self.sender.clone(),
            recipients: self.recipients.clone(),
            subject,
            body: MessageBody::Html(body),
            reply_to: deliverable_reply_to(submission).map(String::from),
        })
    }

    /// The courtesy copy for the submitter, if enabled and they left an address mail can be
    /// delivered to.
    pub fn acknowledgement(
        &self,
        submission: &ValidSubmission,
    ) -> Result<Option<OutboundMessage>, ComposeError> {
        if !self.send_acknowledgement {
            return Ok(None);
        }
        let Some(email) = deliverable_reply_to(submission) else {
            return Ok(None);
        };
        let mut tt = TinyTemplate::new();
        tt.set_default_formatter(&format_unescaped);
        tt.add_template(ACKNOWLEDGEMENT_TEMPLATE_NAME, ACKNOWLEDGEMENT_TEMPLATE)?;
        let body = tt.render(ACKNOWLEDGEMENT_TEMPLATE_NAME, &Context::new(submission))?;
        Ok(Some(OutboundMessage {
            sender: self.sender.clone(),
            recipients: vec![email.into()],
            subject: ACKNOWLEDGEMENT_SUBJECT.into(),
            body: MessageBody::Text(body),
            reply_to: self.recipients.first().cloned(),
        }))
    }
}

/// The submitter's address, if it also parses as a mailbox. Some addresses pass validation but
/// are refused by the mail builder; those stay in the body only.
fn deliverable_reply_to(submission: &ValidSubmission) -> Option<&str> {
    let email = submission.reply_to()?;
    match email.parse::<Mailbox>() {
        Ok(_) => Some(email),
        Err(error) => {
            warn!("Not using {email:?} as reply-to: {error}");
            None
        }
    }
}

fn render_line_breaks(value: &Value, output: &mut String) -> tinytemplate::error::Result<()> {
    let mut escaped = String::new();
    format(value, &mut escaped)?;
    output.push_str(&escaped.replace("\r\n", "\n").replace('\n', "<br>"));
    Ok(())
}

#[derive(Error, Debug)]
pub enum ComposeError {
    #[error("No recipients configured")]
    NoRecipients,
    #[error("Error rendering message: {0}")]
    Template(#[from] tinytemplate::error::Error),
}
