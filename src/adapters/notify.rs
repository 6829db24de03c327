//! Notification transports.
//!
//! - [`LogNotifier`] writes notifications to the log; the default when no
//!   SMTP server is configured.
//! - [`SmtpNotifier`] sends plain-text mail through an SMTP relay.  The
//!   message is built on the caller's thread so address errors surface at
//!   once; delivery happens on a dedicated sender thread so a slow relay
//!   never stalls the control loop.

use std::sync::mpsc::{self, Sender};
use std::thread;

use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use log::{info, warn};

use crate::app::ports::Notifier;
use crate::config::SmtpConfig;
use crate::error::NotifyError;

#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn send(
        &mut self,
        recipients: &[String],
        subject: &str,
        body: &str,
    ) -> Result<(), NotifyError> {
        if recipients.is_empty() {
            return Err(NotifyError::NoRecipients);
        }
        info!(
            "NOTIFY | to={} | {} | {}",
            recipients.join(","),
            subject,
            body.replace('\n', " / ")
        );
        Ok(())
    }
}

/// SMTP notifier backed by a `lettre` transport.
pub struct SmtpNotifier {
    from: Mailbox,
    outbox: Sender<Message>,
}

impl SmtpNotifier {
    /// Build the transport and start the sender thread.  Nothing connects
    /// until the first message is sent.
    pub fn new(config: &SmtpConfig) -> Result<Self, NotifyError> {
        let from: Mailbox = config
            .from
            .parse()
            .map_err(|e| NotifyError::Transport(format!("from {:?}: {}", config.from, e)))?;

        // `ssl` is implicit TLS (SMTPS); otherwise the session is upgraded
        // with STARTTLS.
        let builder = if config.ssl {
            SmtpTransport::relay(&config.host)
        } else {
            SmtpTransport::starttls_relay(&config.host)
        }
        .map_err(|e| NotifyError::Transport(format!("{}: {}", config.host, e)))?;
        let mut builder = builder.port(config.port);
        if let (Some(user), Some(pass)) = (&config.user, &config.password) {
            builder = builder.credentials(Credentials::new(user.clone(), pass.clone()));
        }
        let transport = builder.build();

        let (outbox, queue) = mpsc::channel::<Message>();
        let relay = format!("{}:{}", config.host, config.port);
        thread::Builder::new()
            .name("growctl-smtp".into())
            .spawn(move || {
                for message in queue {
                    match transport.send(&message) {
                        Ok(_) => info!("Notify: mail delivered via {}", relay),
                        Err(e) => warn!("Notify: SMTP delivery via {} failed: {}", relay, e),
                    }
                }
            })
            .map_err(|e| NotifyError::Transport(e.to_string()))?;

        Ok(Self { from, outbox })
    }

    /// Assemble the message without sending it.
    pub fn compose(
        &self,
        recipients: &[String],
        subject: &str,
        body: &str,
    ) -> Result<Message, NotifyError> {
        if recipients.is_empty() {
            return Err(NotifyError::NoRecipients);
        }
        let mut builder = Message::builder().from(self.from.clone()).subject(subject);
        for to in recipients {
            let mailbox: Mailbox = to
                .parse()
                .map_err(|e| NotifyError::Transport(format!("to {:?}: {}", to, e)))?;
            builder = builder.to(mailbox);
        }
        builder
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_owned())
            .map_err(|e| NotifyError::Transport(e.to_string()))
    }
}

impl Notifier for SmtpNotifier {
    fn send(
        &mut self,
        recipients: &[String],
        subject: &str,
        body: &str,
    ) -> Result<(), NotifyError> {
        let message = self.compose(recipients, subject, body)?;
        self.outbox
            .send(message)
            .map_err(|_| NotifyError::Transport("SMTP sender thread stopped".into()))
    }
}
