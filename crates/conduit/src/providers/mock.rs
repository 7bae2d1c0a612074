use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::errors::ProviderError;
use crate::models::message::Message;
use crate::providers::base::{ModelRequest, Provider, Usage};

#[derive(Clone)]
enum Script {
    Queue(Arc<Mutex<Vec<Message>>>),
    Repeat(Message),
    Fail,
}

/// A mock provider that returns pre-configured responses for testing
pub struct MockProvider {
    script: Script,
    calls: AtomicUsize,
    requests: Mutex<Vec<ModelRequest>>,
}

impl MockProvider {
    /// Create a new mock provider with a sequence of responses
    pub fn new(responses: Vec<Message>) -> Self {
        Self::with_script(Script::Queue(Arc::new(Mutex::new(responses))))
    }

    /// Answer every request with the same message
    pub fn repeating(message: Message) -> Self {
        Self::with_script(Script::Repeat(message))
    }

    /// Every request fails as if the backend were unreachable
    pub fn failing() -> Self {
        Self::with_script(Script::Fail)
    }

    fn with_script(script: Script) -> Self {
        Self {
            script,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Every request received so far, in order
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Provider for MockProvider {
    async fn complete(&self, request: &ModelRequest) -> Result<(Message, Usage), ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());

        let message = match &self.script {
            Script::Queue(responses) => {
                let mut responses = responses.lock().unwrap();
                if responses.is_empty() {
                    // Return empty response if no more pre-configured responses
                    Message::assistant().with_text("")
                } else {
                    responses.remove(0)
                }
            }
            Script::Repeat(message) => message.clone(),
            Script::Fail => {
                return Err(ProviderError::Api("mock backend is down".to_string()));
            }
        };
        Ok((message, Usage::new(Some(10), Some(5), Some(15))))
    }
}
