use lettre::{
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
    message::header::ContentType,
    transport::smtp::authentication::Credentials,
};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::config::SmtpConfig;

/// Outbound mail handle. Cheap to clone; the SMTP transport pools
/// connections internally.
#[derive(Clone)]
pub struct Mailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: String,
}

impl Mailer {
    pub fn from_config(config: &SmtpConfig) -> anyhow::Result<Self> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)?
            .port(config.port)
            .credentials(Credentials::new(
                config.username.clone(),
                config.password.clone(),
            ))
            .build();
        Ok(Self {
            transport,
            from: config.from.clone(),
        })
    }

    async fn send_order_confirmation(
        &self,
        to: &str,
        order_id: Uuid,
        total_price: Decimal,
    ) -> anyhow::Result<()> {
        let body = format!(
            "<h1>Thank you for your order!</h1>\
             <p>Your order <strong>#{order_id}</strong> has been successfully placed.</p>\
             <p>Total amount: <strong>${total_price}</strong></p>\
             <p>We will send another email once your order has shipped.</p>"
        );
        let message = Message::builder()
            .from(self.from.parse()?)
            .to(to.parse()?)
            .subject(format!("Order Confirmation #{order_id}"))
            .header(ContentType::TEXT_HTML)
            .body(body)?;
        self.transport.send(message).await?;
        Ok(())
    }
}

/// Fire-and-forget order confirmation. Checkout must never fail or block on
/// mail delivery, so the send runs on a detached task and failures only
/// produce a log line.
pub fn dispatch_order_confirmation(
    mailer: Option<Mailer>,
    to: String,
    order_id: Uuid,
    total_price: Decimal,
) {
    let Some(mailer) = mailer else {
        tracing::debug!(%order_id, "mailer not configured, skipping order confirmation");
        return;
    };
    tokio::spawn(async move {
        match mailer.send_order_confirmation(&to, order_id, total_price).await {
            Ok(()) => tracing::info!(%order_id, to = %to, "order confirmation sent"),
            Err(err) => {
                tracing::warn!(%order_id, to = %to, error = %err, "order confirmation failed")
            }
        }
    });
}
