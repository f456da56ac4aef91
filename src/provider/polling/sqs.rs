//! AWS SQS binding for the polling adapter, using `aws-sdk-sqs`.
//!
//! Works against AWS itself or any SQS-compatible endpoint (set
//! `sqs_endpoint`, typically together with static credentials).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use aws_config::{BehaviorVersion, Region};
use aws_sdk_sqs::config::Credentials;
use aws_sdk_sqs::error::{DisplayErrorContext, SdkError};
use aws_sdk_sqs::operation::get_queue_url::GetQueueUrlError;
use aws_sdk_sqs::types::MessageAttributeValue;
use aws_sdk_sqs::Client;

use crate::{
    //
    log_debug,
    log_info,
    ProviderConfig,
    ProviderPtr,
    QueueError,
    QueueName,
    Result,
};

use super::{
    //
    BackendAttribute,
    PollingBackend,
    PollingProvider,
    ReceivedMessage,
};

/// Longest long-poll wait SQS accepts, in seconds.
const MAX_WAIT_SECONDS: u64 = 20;

/// [`PollingBackend`] over an SQS client.
pub struct SqsBackend {
    client: Client,
}

impl SqsBackend {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn transport<E>(op: &str, err: E) -> QueueError
where
    E: std::error::Error,
{
    QueueError::Transport(format!("sqs: {op} failed: {}", DisplayErrorContext(err)))
}

/// A missing queue is `Ok(None)`; any other lookup failure is a transport error.
fn lookup_failure(err: SdkError<GetQueueUrlError>) -> Result<Option<String>> {
    // ---
    let missing = err
        .as_service_error()
        .map(|svc| svc.is_queue_does_not_exist())
        .unwrap_or(false);

    if missing {
        Ok(None)
    } else {
        Err(transport("get_queue_url", err))
    }
}

#[async_trait::async_trait]
impl PollingBackend for SqsBackend {
    // ---
    fn backend_name(&self) -> &'static str {
        "sqs"
    }

    async fn lookup_queue(&self, queue: &QueueName) -> Result<Option<String>> {
        // ---
        match self.client.get_queue_url().queue_name(queue.as_str()).send().await {
            Ok(output) => Ok(output.queue_url().map(str::to_string)),
            Err(e) => lookup_failure(e),
        }
    }

    async fn create_queue(&self, queue: &QueueName) -> Result<String> {
        // ---
        let output = self
            .client
            .create_queue()
            .queue_name(queue.as_str())
            .send()
            .await
            .map_err(|e| {
                QueueError::creation_failed(queue.as_str(), DisplayErrorContext(e).to_string())
            })?;

        output
            .queue_url()
            .map(str::to_string)
            .ok_or_else(|| QueueError::creation_failed(queue.as_str(), "no queue URL returned"))
    }

    async fn send_message(
        &self,
        queue_url: &str,
        body: &str,
        attributes: HashMap<String, BackendAttribute>,
    ) -> Result<String> {
        // ---
        let mut sqs_attributes = HashMap::with_capacity(attributes.len());
        for (key, attr) in attributes {
            let value = MessageAttributeValue::builder()
                .data_type(attr.data_type)
                .set_string_value(attr.string_value)
                .build()
                .map_err(|e| transport("build message attribute", e))?;
            sqs_attributes.insert(key, value);
        }

        let output = self
            .client
            .send_message()
            .queue_url(queue_url)
            .message_body(body)
            .set_message_attributes(if sqs_attributes.is_empty() {
                None
            } else {
                Some(sqs_attributes)
            })
            .send()
            .await
            .map_err(|e| transport("send_message", e))?;

        Ok(output.message_id().unwrap_or_default().to_string())
    }

    async fn receive_messages(
        &self,
        queue_url: &str,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<ReceivedMessage>> {
        // ---
        let output = self
            .client
            .receive_message()
            .queue_url(queue_url)
            .max_number_of_messages(max_messages as i32)
            .wait_time_seconds(wait.as_secs().min(MAX_WAIT_SECONDS) as i32)
            .message_attribute_names("All")
            .send()
            .await
            .map_err(|e| transport("receive_message", e))?;

        let messages = output
            .messages()
            .iter()
            .filter_map(|m| {
                // A message without a receipt handle can never be deleted.
                let receipt_handle = m.receipt_handle()?.to_string();

                let attributes = m
                    .message_attributes()
                    .map(|attrs| {
                        attrs
                            .iter()
                            .map(|(k, v)| {
                                let attr = BackendAttribute {
                                    data_type: v.data_type().to_string(),
                                    string_value: v.string_value().map(str::to_string),
                                };
                                (k.clone(), attr)
                            })
                            .collect()
                    })
                    .unwrap_or_default();

                Some(ReceivedMessage {
                    message_id: m.message_id().map(str::to_string),
                    body: m.body().unwrap_or_default().to_string(),
                    attributes,
                    receipt_handle,
                })
            })
            .collect();

        Ok(messages)
    }

    async fn delete_message(&self, queue_url: &str, receipt_handle: &str) -> Result<()> {
        // ---
        self.client
            .delete_message()
            .queue_url(queue_url)
            .receipt_handle(receipt_handle)
            .send()
            .await
            .map_err(|e| transport("delete_message", e))?;

        log_debug!("sqs: deleted receipt on {queue_url}");
        Ok(())
    }
}

/// Creates an SQS-backed polling provider from the given configuration.
///
/// # Errors
///
/// Returns [`QueueError::MissingConfig`] if no region is configured.
pub async fn create_sqs_provider(config: &ProviderConfig) -> Result<ProviderPtr> {
    // ---
    let region = config
        .sqs_region
        .clone()
        .ok_or_else(|| QueueError::MissingConfig("sqs provider requires sqs_region".into()))?;

    log_info!("[{}] configuring SQS client for {region}", config.provider_id);

    let shared = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(region))
        .load()
        .await;

    let mut builder = aws_sdk_sqs::config::Builder::from(&shared);

    if let Some(endpoint) = &config.sqs_endpoint {
        log_info!("[{}] using SQS endpoint {endpoint}", config.provider_id);
        builder = builder.endpoint_url(endpoint);
    }

    if let Some(credentials) = &config.sqs_credentials {
        builder = builder.credentials_provider(Credentials::new(
            credentials.access_key_id.clone(),
            credentials.secret_access_key.clone(),
            None,
            None,
            "static",
        ));
    }

    let backend = Arc::new(SqsBackend::new(Client::from_conf(builder.build())));

    Ok(Arc::new(PollingProvider::new(
        config.provider_id.clone(),
        backend,
        config.polling.clone(),
    )))
}
