//! Delivery of activation requests to the activation server

use std::future::Future;

use tracing::{debug, info};

use crate::{
    IdeviceError,
    request::{ACTIVATION_URL, ActivationRequest, USER_AGENT},
};

/// Sends one activation request and hands back the raw response body
pub trait ActivationTransport: Send + Sync {
    fn post(
        &self,
        request: &ActivationRequest,
    ) -> impl Future<Output = Result<Vec<u8>, IdeviceError>> + Send;
}

/// HTTPS transport to Apple's activation server
///
/// No timeout is set: a server that never answers blocks the run until the
/// connection drops. The status code is not checked, the server reports
/// activation errors in the body of 200 responses anyway.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
}

impl HttpTransport {
    pub fn new() -> Result<Self, IdeviceError> {
        Self::with_url(ACTIVATION_URL)
    }

    /// Creates a transport posting to another endpoint
    pub fn with_url(url: impl Into<String>) -> Result<Self, IdeviceError> {
        let client = reqwest::Client::builder().user_agent(USER_AGENT).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl ActivationTransport for HttpTransport {
    async fn post(&self, request: &ActivationRequest) -> Result<Vec<u8>, IdeviceError> {
        info!("Sending activation request to {}", self.url);
        let mut req = self.client.post(&self.url).multipart(request.to_form());
        for (k, v) in request.headers() {
            req = req.header(*k, *v);
        }

        let res = req.send().await?;
        debug!("Activation server responded with {}", res.status());
        let body = res.bytes().await?;
        debug!("Read {} bytes of activation response", body.len());
        Ok(body.to_vec())
    }
}
