use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::{
    CheckRequest, CheckResponse, CreateRequest, CreateResponse, DeleteRequest, DiffRequest,
    DiffResponse, ReadRequest, ReadResponse, ResourceProvider, UpdateRequest, UpdateResponse,
};
use crate::error::ProviderError;
use crate::BoxFuture;

/// Result of a mutating call.
///
/// `cancelled` is set when the run was cancelled while the call was in
/// flight. The call was still awaited up to its deadline, so `result` holds
/// whatever the provider actually did; the step must nonetheless be
/// reported as failed.
#[derive(Debug)]
pub struct Completion<T> {
    pub result: Result<T, ProviderError>,
    pub cancelled: bool,
}

/// A provider bound to a run: every call gets a deadline and observes the
/// run's cancellation token.
#[derive(Clone)]
pub struct ProviderClient {
    provider: Arc<dyn ResourceProvider>,
    cancel: CancellationToken,
    read_timeout: Duration,
}

impl ProviderClient {
    pub fn new(
        provider: Arc<dyn ResourceProvider>,
        cancel: CancellationToken,
        read_timeout: Duration,
    ) -> Self {
        Self {
            provider,
            cancel,
            read_timeout,
        }
    }

    pub async fn check(&self, request: CheckRequest) -> Result<CheckResponse, ProviderError> {
        self.query(self.provider.check(request)).await
    }

    pub async fn diff(&self, request: DiffRequest) -> Result<DiffResponse, ProviderError> {
        self.query(self.provider.diff(request)).await
    }

    pub async fn read(&self, request: ReadRequest) -> Result<ReadResponse, ProviderError> {
        self.query(self.provider.read(request)).await
    }

    pub async fn create(&self, request: CreateRequest) -> Completion<CreateResponse> {
        let timeout = Duration::from_secs(request.timeout_secs);
        self.mutate(timeout, self.provider.create(request)).await
    }

    pub async fn update(&self, request: UpdateRequest) -> Completion<UpdateResponse> {
        let timeout = Duration::from_secs(request.timeout_secs);
        self.mutate(timeout, self.provider.update(request)).await
    }

    pub async fn delete(&self, request: DeleteRequest) -> Completion<()> {
        let timeout = Duration::from_secs(request.timeout_secs);
        self.mutate(timeout, self.provider.delete(request)).await
    }

    /// Side-effect free calls are abandoned as soon as the run is cancelled.
    async fn query<T>(
        &self,
        call: BoxFuture<'_, Result<T, ProviderError>>,
    ) -> Result<T, ProviderError> {
        tokio::select! {
            result = call => result,
            _ = tokio::time::sleep(self.read_timeout) => Err(ProviderError::Timeout(self.read_timeout)),
            _ = self.cancel.cancelled() => Err(ProviderError::Cancelled),
        }
    }

    async fn mutate<T>(
        &self,
        timeout: Duration,
        call: BoxFuture<'_, Result<T, ProviderError>>,
    ) -> Completion<T> {
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        let mut call = call;

        tokio::select! {
            result = &mut call => return Completion { result, cancelled: false },
            _ = &mut deadline => {
                return Completion {
                    result: Err(ProviderError::Timeout(timeout)),
                    cancelled: false,
                };
            }
            _ = self.cancel.cancelled() => {}
        }

        tracing::warn!("run cancelled with a provider call in flight, waiting for it to settle");
        self.provider.cancel().await;

        let result = tokio::select! {
            result = &mut call => result,
            _ = &mut deadline => Err(ProviderError::Timeout(timeout)),
        };
        Completion {
            result,
            cancelled: true,
        }
    }
}
