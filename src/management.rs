use anyhow::{anyhow, Context, Result};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

/// Client for the out-of-band device-management facade. Used for attribute
/// maintenance, never on the ingest hot path.
pub struct ManagementClient {
    client: Client,
    api_url: String,
    username: String,
    password: String,
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Reply {
    #[serde(default)]
    auth: Option<CommandReply>,
    #[serde(default)]
    cmd: Option<CommandReply>,
}

#[derive(Debug, Deserialize)]
struct CommandReply {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    params: Option<Value>,
    #[serde(default, rename = "errorMessages")]
    error_messages: Option<Value>,
}

impl ManagementClient {
    pub fn new(api_url: String, username: String, password: String) -> Self {
        Self {
            client: Client::new(),
            api_url,
            username,
            password,
            session_id: None,
        }
    }

    /// Authenticate lazily and reuse the session id across commands.
    async fn session_id(&mut self) -> Result<String> {
        if let Some(session) = &self.session_id {
            return Ok(session.clone());
        }
        let body = authenticate_command(&self.username, &self.password);
        let reply: Reply = self
            .client
            .post(&self.api_url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let session = reply
            .auth
            .and_then(|auth| auth.params)
            .and_then(|params| {
                params
                    .get("sessionId")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .ok_or_else(|| anyhow!("authentication reply carried no session id"))?;
        self.session_id = Some(session.clone());
        Ok(session)
    }

    async fn execute(&mut self, command: Value) -> Result<CommandReply> {
        let session = self.session_id().await?;
        let body = json!({ "auth": { "sessionId": session }, "cmd": command });
        let reply: Reply = self
            .client
            .post(&self.api_url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        reply.cmd.context("facade reply carried no command result")
    }

    fn expect_success(cmd: CommandReply) -> Result<CommandReply> {
        if cmd.success {
            Ok(cmd)
        } else {
            Err(anyhow!(
                "facade command failed: {:?}",
                cmd.error_messages.unwrap_or(Value::Null)
            ))
        }
    }

    /// Current value of one attribute, as the facade reports it.
    pub async fn attribute(&mut self, device: &str, attribute: &str) -> Result<Value> {
        let cmd = Self::expect_success(self.execute(attr_get_command(device, attribute)).await?)?;
        cmd.params
            .and_then(|params| params.get("value").cloned())
            .context("attribute reply carried no value")
    }

    pub async fn set_attribute(&mut self, device: &str, attribute: &str, value: &str) -> Result<()> {
        Self::expect_success(
            self.execute(attr_set_command(device, attribute, value))
                .await?,
        )?;
        Ok(())
    }

    /// Reset an attribute back to null.
    pub async fn unset_attribute(&mut self, device: &str, attribute: &str) -> Result<()> {
        Self::expect_success(self.execute(attr_unset_command(device, attribute)).await?)?;
        Ok(())
    }

    /// Resolve a device identifier to its facade key, if the facade knows it.
    pub async fn find_device(&mut self, device: &str) -> Result<Option<String>> {
        let cmd = self.execute(find_command(device)).await?;
        if !cmd.success {
            return Ok(None);
        }
        Ok(cmd.params.and_then(|params| {
            params
                .get("key")
                .and_then(Value::as_str)
                .map(str::to_string)
        }))
    }
}

fn authenticate_command(username: &str, password: &str) -> Value {
    json!({
        "auth": {
            "command": "api.authenticate",
            "params": { "username": username, "password": password }
        }
    })
}

fn attr_get_command(device: &str, attribute: &str) -> Value {
    json!({ "command": "thing.attr.get", "params": { "thingKey": device, "key": attribute } })
}

fn attr_set_command(device: &str, attribute: &str, value: &str) -> Value {
    json!({
        "command": "thing.attr.set",
        "params": { "thingKey": device, "key": attribute, "value": value }
    })
}

fn attr_unset_command(device: &str, attribute: &str) -> Value {
    json!({ "command": "thing.attr.unset", "params": { "thingKey": device, "key": attribute } })
}

fn find_command(device: &str) -> Value {
    json!({ "command": "thing.find", "params": { "key": device } })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authenticate_envelope_matches_wire_shape() {
        let body = authenticate_command("fleet", "secret");
        assert_eq!(body["auth"]["command"], "api.authenticate");
        assert_eq!(body["auth"]["params"]["username"], "fleet");
        assert_eq!(body["auth"]["params"]["password"], "secret");
    }

    #[test]
    fn attribute_commands_key_by_device_and_attribute() {
        let get = attr_get_command("350081091492945", "swd_pingcmd");
        assert_eq!(get["command"], "thing.attr.get");
        assert_eq!(get["params"]["thingKey"], "350081091492945");
        assert_eq!(get["params"]["key"], "swd_pingcmd");

        let set = attr_set_command("350081091492945", "swd_pingcmd", "3");
        assert_eq!(set["command"], "thing.attr.set");
        assert_eq!(set["params"]["value"], "3");

        let unset = attr_unset_command("350081091492945", "swd_pingcmd");
        assert_eq!(unset["command"], "thing.attr.unset");
        assert!(unset["params"].get("value").is_none());

        let find = find_command("350081091492945");
        assert_eq!(find["command"], "thing.find");
        assert_eq!(find["params"]["key"], "350081091492945");
    }

    #[test]
    fn reply_parses_session_and_command_results() {
        let raw = r#"{"auth":{"success":true,"params":{"sessionId":"abc123"}}}"#;
        let reply: Reply = serde_json::from_str(raw).unwrap();
        let auth = reply.auth.unwrap();
        assert!(auth.success);
        assert_eq!(auth.params.unwrap()["sessionId"], "abc123");

        let raw = r#"{"cmd":{"success":false,"errorMessages":["denied"],"errorCodes":[-90000]}}"#;
        let reply: Reply = serde_json::from_str(raw).unwrap();
        let cmd = reply.cmd.unwrap();
        assert!(!cmd.success);
        assert!(cmd.error_messages.is_some());
        assert!(ManagementClient::expect_success(cmd).is_err());
    }
}
