use crate::options::AccessOptions;
use crate::retry::{retry, RetryPolicy};
use crate::tools::{ClusterClient, HttpProbe, HttpResponse, Tunnel};
use crate::HarnessError;

/// Accepts only a 200 whose body contains `marker`.
pub fn response_is_valid(response: &HttpResponse, marker: &str) -> bool {
    response.status == 200 && response.body.contains(marker)
}

/// Closes the tunnel exactly once: on `release`, or on drop if the owning
/// scope exits early by error or panic.
struct TunnelGuard {
    tunnel: Option<Box<dyn Tunnel>>,
}

impl TunnelGuard {
    fn new(tunnel: Box<dyn Tunnel>) -> Self {
        Self {
            tunnel: Some(tunnel),
        }
    }

    fn endpoint(&self) -> String {
        self.tunnel
            .as_ref()
            .map(|t| t.endpoint())
            .unwrap_or_default()
    }

    fn release(&mut self) {
        if let Some(mut tunnel) = self.tunnel.take() {
            if tunnel.is_closed() {
                return;
            }
            tracing::debug!(endpoint = %tunnel.endpoint(), "closing tunnel");
            tunnel.close();
            if !tunnel.is_closed() {
                tracing::warn!(endpoint = %tunnel.endpoint(), "tunnel still reports open after close");
            }
        }
    }
}

impl Drop for TunnelGuard {
    fn drop(&mut self) {
        self.release();
    }
}

pub struct NetworkValidator<'a> {
    client: &'a dyn ClusterClient,
    http: &'a dyn HttpProbe,
    availability: RetryPolicy,
    validation: RetryPolicy,
    remote_port: u16,
}

impl<'a> NetworkValidator<'a> {
    pub fn new(
        client: &'a dyn ClusterClient,
        http: &'a dyn HttpProbe,
        availability: RetryPolicy,
        validation: RetryPolicy,
        remote_port: u16,
    ) -> Self {
        Self {
            client,
            http,
            availability,
            validation,
            remote_port,
        }
    }

    /// Waits for `resource_name`, tunnels to it and GETs until a valid
    /// response arrives. Any tunnel opened here is closed before returning.
    pub fn verify(
        &self,
        handle: &AccessOptions,
        resource_name: &str,
        expected_substring: &str,
    ) -> Result<(), HarnessError> {
        retry(
            &format!("workload {} available", resource_name),
            &self.availability,
            |_| match self.client.workload_available(handle, resource_name) {
                Ok(true) => Ok(()),
                Ok(false) => Err("not available yet".to_string()),
                Err(e) => Err(e.to_string()),
            },
        )
        .map_err(|e| HarnessError::ResourceNotAvailable(e.to_string()))?;

        let tunnel = self
            .client
            .open_tunnel(handle, resource_name, self.remote_port)
            .map_err(|e| HarnessError::TunnelOpenFailed(format!("{}: {}", resource_name, e)))?;
        let mut guard = TunnelGuard::new(tunnel);
        let url = format!("http://{}", guard.endpoint());
        tracing::info!(resource = resource_name, url = %url, "tunnel open; validating");

        // Transient and permanent failures are not told apart; the bound covers both.
        let outcome = retry(&format!("GET {}", url), &self.validation, |_| {
            let response = self.http.get(&url)?;
            if response_is_valid(&response, expected_substring) {
                Ok(())
            } else {
                Err(format!(
                    "status {} (body {} marker '{}')",
                    response.status,
                    if response.body.contains(expected_substring) {
                        "contains"
                    } else {
                        "lacks"
                    },
                    expected_substring
                ))
            }
        });
        guard.release();

        outcome.map_err(|e| HarnessError::ValidationTimeout(e.to_string()))?;
        tracing::info!(resource = resource_name, "workload validated");
        Ok(())
    }
}
