use std::sync::OnceLock;

use crate::{client, Client, ClientOptions, Error, Event};

static GLOBAL_CLIENT: OnceLock<Client> = OnceLock::new();

/// Install a process-wide client. Errors if one is already installed.
pub async fn init_global_client<C: Into<ClientOptions>>(options: C) -> Result<(), Error> {
    let client = client(options).await;
    GLOBAL_CLIENT
        .set(client)
        .map_err(|_| Error::AlreadyInitialized)
}

/// The process-wide client, if one was installed.
pub fn global_client() -> Option<&'static Client> {
    GLOBAL_CLIENT.get()
}

/// Capture through the process-wide client.
pub fn capture(event: Event) -> Result<bool, Error> {
    let client = GLOBAL_CLIENT.get().ok_or(Error::NotInitialized)?;
    Ok(client.capture(event))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_without_init_reports_not_initialized() {
        // The global is process-wide, so this test must run before any
        // init; it only asserts the uninitialized path.
        if GLOBAL_CLIENT.get().is_none() {
            let result = capture(Event::new("event", "distinct-id"));
            assert!(matches!(result, Err(Error::NotInitialized)));
        }
    }
}
