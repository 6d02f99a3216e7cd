use reqwest::blocking::Client;
use reqwest::Method;
use serde_json::{json, Value};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{DocumentSurface, ElementHandle, ElementRect, ElementState};
use crate::errors::AutomationError;
use crate::selector::Selector;

// W3C element reference key
const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";
const ENTER_KEY: &str = "\u{E007}";

/// [`DocumentSurface`] backed by a W3C WebDriver session (chromedriver,
/// msedgedriver, ...).
#[derive(Debug)]
pub struct WebDriverSurface {
    endpoint: String,
    session_id: String,
    client: Client,
}

impl WebDriverSurface {
    /// Capabilities for Chrome that save downloads into `download_dir` without prompting.
    pub fn chrome_capabilities(download_dir: &Path) -> Value {
        json!({
            "browserName": "chrome",
            "goog:chromeOptions": {
                "args": ["--start-maximized", "--disable-notifications"],
                "prefs": {
                    "download.default_directory": download_dir.to_string_lossy(),
                    "download.prompt_for_download": false,
                    "plugins.always_open_pdf_externally": true
                }
            }
        })
    }

    /// Start a new session on the WebDriver server at `endpoint`.
    pub fn connect(
        endpoint: &str,
        capabilities: Value,
        timeout: Duration,
    ) -> Result<Self, AutomationError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AutomationError::Http(format!("Failed to build http client: {e}")))?;
        let endpoint = endpoint.trim_end_matches('/').to_string();

        let response = client
            .post(format!("{endpoint}/session"))
            .json(&json!({ "capabilities": { "alwaysMatch": capabilities } }))
            .send()?;
        let value = Self::unwrap_response(response)?;
        let session_id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                AutomationError::PlatformError(format!(
                    "WebDriver did not return a session id: {value}"
                ))
            })?
            .to_string();

        info!("Started WebDriver session {} at {}", session_id, endpoint);
        Ok(Self {
            endpoint,
            session_id,
            client,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// End the browser session.
    pub fn close(&self) -> Result<(), AutomationError> {
        self.command(Method::DELETE, "", None)?;
        info!("Closed WebDriver session {}", self.session_id);
        Ok(())
    }

    fn unwrap_response(response: reqwest::blocking::Response) -> Result<Value, AutomationError> {
        let status = response.status();
        let body: Value = response.json()?;
        let value = body.get("value").cloned().unwrap_or(Value::Null);

        if let Some(error) = value.get("error").and_then(Value::as_str) {
            let message = value
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default();
            return Err(match error {
                "no such element" | "stale element reference" => {
                    AutomationError::PlatformError(format!("{error}: {message}"))
                }
                "timeout" | "script timeout" => {
                    AutomationError::Timeout(format!("{error}: {message}"))
                }
                "invalid selector" | "invalid argument" => {
                    AutomationError::InvalidArgument(format!("{error}: {message}"))
                }
                _ => AutomationError::Http(format!("WebDriver {status} {error}: {message}")),
            });
        }
        if !status.is_success() {
            return Err(AutomationError::Http(format!("WebDriver returned {status}")));
        }
        Ok(value)
    }

    fn command(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value, AutomationError> {
        let url = format!("{}/session/{}{}", self.endpoint, self.session_id, path);
        debug!("WebDriver {} {}", method, path);
        let mut request = self.client.request(method.clone(), &url);
        if method != Method::GET && method != Method::DELETE {
            request = request.json(&body.unwrap_or_else(|| json!({})));
        }
        Self::unwrap_response(request.send()?)
    }

    fn element_command(
        &self,
        method: Method,
        element: &ElementHandle,
        action: &str,
        body: Option<Value>,
    ) -> Result<Value, AutomationError> {
        self.command(method, &format!("/element/{}/{}", element.0, action), body)
    }
}

impl DocumentSurface for WebDriverSurface {
    fn navigate(&self, url: &str) -> Result<(), AutomationError> {
        self.command(Method::POST, "/url", Some(json!({ "url": url })))?;
        Ok(())
    }

    fn refresh(&self) -> Result<(), AutomationError> {
        self.command(Method::POST, "/refresh", None)?;
        Ok(())
    }

    fn find_all(&self, selector: &Selector) -> Result<Vec<ElementHandle>, AutomationError> {
        let (using, value) = selector.to_webdriver().ok_or_else(|| {
            AutomationError::InvalidArgument(format!("cannot search with {selector}"))
        })?;
        let found = self.command(
            Method::POST,
            "/elements",
            Some(json!({ "using": using, "value": value })),
        )?;

        let handles = found
            .as_array()
            .map(|elements| {
                elements
                    .iter()
                    .filter_map(|e| e.get(ELEMENT_KEY).and_then(Value::as_str))
                    .map(|id| ElementHandle(id.to_string()))
                    .collect()
            })
            .unwrap_or_default();
        Ok(handles)
    }

    fn state(&self, element: &ElementHandle) -> Result<ElementState, AutomationError> {
        let displayed = self
            .element_command(Method::GET, element, "displayed", None)?
            .as_bool()
            .unwrap_or(false);
        let enabled = self
            .element_command(Method::GET, element, "enabled", None)?
            .as_bool()
            .unwrap_or(false);
        let rect: ElementRect =
            match serde_json::from_value(self.element_command(Method::GET, element, "rect", None)?) {
                Ok(rect) => rect,
                Err(e) => {
                    warn!("Unreadable rect for element {}: {}", element.0, e);
                    ElementRect::default()
                }
            };
        Ok(ElementState {
            displayed,
            enabled,
            rect,
        })
    }

    fn text(&self, element: &ElementHandle) -> Result<String, AutomationError> {
        let value = self.element_command(Method::GET, element, "text", None)?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    fn clear(&self, element: &ElementHandle) -> Result<(), AutomationError> {
        self.element_command(Method::POST, element, "clear", None)?;
        Ok(())
    }

    fn type_text(&self, element: &ElementHandle, text: &str) -> Result<(), AutomationError> {
        self.element_command(Method::POST, element, "value", Some(json!({ "text": text })))?;
        Ok(())
    }

    fn click(&self, element: &ElementHandle) -> Result<(), AutomationError> {
        self.element_command(Method::POST, element, "click", None)?;
        Ok(())
    }

    fn press_enter(&self, element: &ElementHandle) -> Result<(), AutomationError> {
        self.type_text(element, ENTER_KEY)
    }

    fn attach_file(&self, element: &ElementHandle, path: &Path) -> Result<(), AutomationError> {
        if !path.exists() {
            return Err(AutomationError::InvalidArgument(format!(
                "file to upload does not exist: {}",
                path.display()
            )));
        }
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()?.join(path)
        };
        self.type_text(element, &absolute.to_string_lossy())
    }
}
