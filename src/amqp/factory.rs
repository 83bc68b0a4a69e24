use crate::amqp::configuration::RabbitMqSettings;
use crate::amqp::convenience::{message_from_delivery, message_properties};
use crate::amqp::transport::{
    Acknowledger, BrokerChannel, BrokerConnection, BrokerConnector, BrokerError, Confirmation,
    Delivery, DeliveryStream, PendingConfirmation,
};
use crate::messages::Message;
use futures_util::{FutureExt, StreamExt};
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions,
    },
    publisher_confirm,
    tcp::{AMQPUriTcpExt, NativeTlsConnector},
    types::FieldTable,
    uri::{AMQPScheme, AMQPUri},
    ChannelState, ConnectionProperties, ConnectionState,
};
use std::sync::Arc;
use tokio::time::timeout;
use tracing::warn;

/// Reply Code 312 - NO_ROUTE
/// See https://www.rabbitmq.com/amqp-0-9-1-reference.html
const NO_ROUTE: u16 = 312;
/// Reply Code 200 - REPLY_SUCCESS
const REPLY_SUCCESS: u16 = 200;

#[derive(Clone)]
/// All the information required to connect to a RabbitMq broker.
///
/// `ConnectionFactory` is the [`BrokerConnector`] backed by [`lapin`].
pub struct ConnectionFactory {
    uri: AMQPUri,
    /// The timeout observed when trying to connect to RabbitMq.
    connection_timeout: std::time::Duration,
    /// TLS configuration for the connection to RabbitMq.
    /// If `None`, the connection will not be encrypted.
    tls: Option<Arc<Tls>>,
}

#[derive(Clone)]
struct Tls {
    connector: NativeTlsConnector,
    domain_name: String,
}

impl ConnectionFactory {
    /// Create a new connection factory from settings.
    ///
    /// A connection timeout can be (optionally) specified in `settings`.
    /// If the connection timeout is left unspecified, it will be defaulted to 10 seconds.
    pub fn new_from_config(settings: &RabbitMqSettings) -> Result<Self, anyhow::Error> {
        let tls = settings
            .tls
            .as_ref()
            .map::<Result<Tls, anyhow::Error>, _>(|tls_settings| {
                let server_domain_name = tls_settings
                    .domain
                    .clone()
                    .unwrap_or_else(|| settings.amqp_uri().authority.host);

                let mut connector_builder = NativeTlsConnector::builder();
                if let Some(certificate) = tls_settings.ca_certificate_chain()? {
                    connector_builder.add_root_certificate(certificate);
                }

                let connector = connector_builder.build()?;
                Ok(Tls {
                    domain_name: server_domain_name,
                    connector,
                })
            })
            .transpose()?;
        let connection_timeout = settings
            .connection_timeout()
            .unwrap_or_else(|| std::time::Duration::from_secs(10));
        Ok(Self {
            uri: settings.amqp_uri(),
            connection_timeout,
            tls: tls.map(Arc::new),
        })
    }

    /// Replaces the TLS Connector for the connection factory, along with the expected domain name for the certificate
    pub fn set_tls_connector_with_domain(
        &mut self,
        connector: NativeTlsConnector,
        domain_name: String,
    ) {
        self.tls = Some(Arc::new(Tls {
            connector,
            domain_name,
        }));
    }

    /// Create a new connection to a RabbitMq broker.
    ///
    /// It establishes an encrypted connection if `self.tls` is `Some`.
    /// It establishes an unencrypted connection if `self.tls` is `None`.
    #[tracing::instrument(name = "rabbitmq_connect", skip(self))]
    pub async fn new_connection(
        &self,
        connection_name: &str,
    ) -> Result<lapin::Connection, anyhow::Error> {
        let properties = ConnectionProperties::default()
            .with_connection_name(connection_name.into())
            .with_executor(tokio_executor_trait::Tokio::current());
        let connection = timeout(self.connection_timeout, async {
            match &self.tls {
                None => self.connect_without_tls(properties).await,
                Some(tls) => self.connect_with_tls(properties, Arc::clone(tls)).await,
            }
        })
        .await??;
        // Register a callback to log connection errors.
        connection.on_error(|e| {
            warn!("RabbitMQ broken connection: {:?}", e);
        });
        Ok(connection)
    }

    /// Establish a new unencrypted connection to a RabbitMq broker.
    async fn connect_without_tls(
        &self,
        properties: ConnectionProperties,
    ) -> Result<lapin::Connection, lapin::Error> {
        lapin::Connection::connect_uri(self.uri.clone(), properties).await
    }

    /// Establish a new TLS connection to a RabbitMq broker.
    async fn connect_with_tls(
        &self,
        properties: ConnectionProperties,
        tls_configuration: Arc<Tls>,
    ) -> Result<lapin::Connection, lapin::Error> {
        lapin::Connection::connector(
            self.uri.clone(),
            Box::new(move |uri| {
                // First establish a plain TCP connection using the AMQP protocol
                let mut amqp_uri = uri.clone();
                amqp_uri.scheme = AMQPScheme::AMQP;
                amqp_uri
                    .connect()
                    // Then perform a TLS handshake with custom settings
                    // including customisation of the expected domain for the server certificate
                    .and_then(|tcp| {
                        tcp.into_native_tls(
                            &tls_configuration.connector,
                            &tls_configuration.domain_name,
                        )
                    })
            }),
            properties,
        )
        .await
    }
}

#[async_trait::async_trait]
impl BrokerConnector for ConnectionFactory {
    async fn connect(
        &self,
        connection_name: &str,
    ) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let connection = self
            .new_connection(connection_name)
            .await
            .map_err(BrokerError::Protocol)?;
        Ok(Arc::new(LapinConnection(connection)))
    }
}

/// A [`lapin::Connection`] seen through the [`BrokerConnection`] interface.
struct LapinConnection(lapin::Connection);

#[async_trait::async_trait]
impl BrokerConnection for LapinConnection {
    fn is_open(&self) -> bool {
        matches!(self.0.status().state(), ConnectionState::Connected)
    }

    fn is_closed(&self) -> bool {
        matches!(
            self.0.status().state(),
            ConnectionState::Closed | ConnectionState::Error
        )
    }

    async fn create_channel(&self) -> Result<Box<dyn BrokerChannel>, BrokerError> {
        let channel = self.0.create_channel().await?;
        Ok(Box::new(LapinChannel(channel)))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        Ok(self.0.close(REPLY_SUCCESS, "Goodbye").await?)
    }
}

/// A [`lapin::Channel`] seen through the [`BrokerChannel`] interface.
struct LapinChannel(lapin::Channel);

#[async_trait::async_trait]
impl BrokerChannel for LapinChannel {
    fn is_open(&self) -> bool {
        matches!(self.0.status().state(), ChannelState::Connected)
    }

    async fn confirm_select(&self) -> Result<(), BrokerError> {
        Ok(self
            .0
            .confirm_select(ConfirmSelectOptions { nowait: false })
            .await?)
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), BrokerError> {
        Ok(self
            .0
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await?)
    }

    async fn basic_publish(
        &self,
        message: &Message,
        mandatory: bool,
    ) -> Result<PendingConfirmation, BrokerError> {
        let options = BasicPublishOptions {
            mandatory,
            // The immediate flag was dropped in RabbitMQ 3.0 - see https://www.rabbitmq.com/blog/2012/11/19/breaking-things-with-rabbitmq-3-0/
            // Setting `true` will cause a not-supported error
            immediate: false,
        };
        let confirm = self
            .0
            .basic_publish(
                &message.exchange,
                &message.routing_key,
                options,
                &message.payload,
                message_properties(message),
            )
            .await?;
        Ok(confirm.map(into_confirmation).boxed())
    }

    async fn basic_consume(
        &self,
        queue_name: &str,
        consumer_tag: &str,
        auto_ack: bool,
    ) -> Result<DeliveryStream, BrokerError> {
        let options = BasicConsumeOptions {
            no_ack: auto_ack,
            ..BasicConsumeOptions::default()
        };
        let consumer = self
            .0
            .basic_consume(queue_name, consumer_tag, options, FieldTable::default())
            .await?;
        Ok(consumer
            .map(move |delivery| into_delivery(delivery, auto_ack))
            .boxed())
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        Ok(self
            .0
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        Ok(self.0.close(REPLY_SUCCESS, "Goodbye").await?)
    }
}

fn into_confirmation(
    confirmation: lapin::Result<publisher_confirm::Confirmation>,
) -> Result<Confirmation, BrokerError> {
    match confirmation? {
        publisher_confirm::Confirmation::Ack(Some(returned)) if returned.reply_code == NO_ROUTE => {
            Ok(Confirmation::Returned {
                reply_code: returned.reply_code,
                reply_text: returned.reply_text.as_str().to_owned(),
            })
        }
        publisher_confirm::Confirmation::Ack(_) => Ok(Confirmation::Ack),
        publisher_confirm::Confirmation::Nack(_) => Ok(Confirmation::Nack),
        publisher_confirm::Confirmation::NotRequested => Ok(Confirmation::NotRequested),
    }
}

fn into_delivery(
    delivery: lapin::Result<lapin::message::Delivery>,
    auto_ack: bool,
) -> Result<Delivery, BrokerError> {
    let delivery = delivery?;
    let message = message_from_delivery(&delivery);
    // Auto-acked deliveries must not be settled again.
    let acker: Option<Arc<dyn Acknowledger>> = if auto_ack {
        None
    } else {
        Some(Arc::new(LapinAcker(delivery.acker)))
    };
    Ok(Delivery {
        delivery_tag: delivery.delivery_tag,
        redelivered: delivery.redelivered,
        message,
        acker,
    })
}

struct LapinAcker(Acker);

#[async_trait::async_trait]
impl Acknowledger for LapinAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        Ok(self.0.ack(BasicAckOptions { multiple: false }).await?)
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        Ok(self
            .0
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await?)
    }

    async fn reject(&self, requeue: bool) -> Result<(), BrokerError> {
        Ok(self.0.reject(BasicRejectOptions { requeue }).await?)
    }
}
