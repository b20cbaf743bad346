use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::debug;
use url::Url;

use super::{
    Fleet, FleetGateway, FleetInput, GatewayError, Instance, LaunchTemplate, LaunchTemplateInput,
    RefreshOutcome, TaggedResource,
};
use crate::resources::awsmachinepools::RefreshPreferences;

/// [`FleetGateway`] speaking JSON to a fleet API adapter in front of the autoscaling and EC2 APIs
pub struct HttpFleetGateway {
    client: reqwest::Client,
    base_url: Url,
    bearer_token: Option<String>,
}

impl HttpFleetGateway {
    pub fn new(base_url: Url, bearer_token: Option<String>) -> anyhow::Result<Self> {
        anyhow::ensure!(
            !base_url.cannot_be_a_base(),
            "fleet API url {base_url} cannot be used as a base url"
        );

        Ok(Self {
            client: reqwest::Client::new(),
            base_url,
            bearer_token,
        })
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: Method, segments: &[&str]) -> RequestBuilder {
        let url = self.url(segments);
        debug!("{method} {url}");

        let mut request_builder = self
            .client
            .request(method, url)
            .header(reqwest::header::ACCEPT, "application/json");

        if let Some(bearer_token) = &self.bearer_token {
            request_builder = request_builder.bearer_auth(bearer_token);
        }

        request_builder
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, GatewayError> {
        let resp = request
            .send()
            .await
            .map_err(|err| GatewayError::Transient(err.to_string()))?;

        if resp.status().is_success() {
            return Ok(resp);
        }

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        Err(classify(status, body))
    }

    async fn json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, GatewayError> {
        self.send(request)
            .await?
            .json()
            .await
            .map_err(|err| GatewayError::Transient(format!("invalid response body: {err}")))
    }

    async fn optional<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
    ) -> Result<Option<T>, GatewayError> {
        match self.json(request).await {
            Ok(value) => Ok(Some(value)),
            Err(GatewayError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Sends a request whose 404 and 409 answers mean the desired end state already holds.
    async fn idempotent_delete(&self, request: RequestBuilder) -> Result<(), GatewayError> {
        match self.send(request).await {
            Ok(_) | Err(GatewayError::NotFound(_)) | Err(GatewayError::Conflict(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

fn classify(status: StatusCode, body: String) -> GatewayError {
    let message = if body.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {body}")
    };

    match status {
        StatusCode::NOT_FOUND => GatewayError::NotFound(message),
        StatusCode::CONFLICT => GatewayError::Conflict(message),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            GatewayError::Rejected(message)
        }
        _ => GatewayError::Transient(message),
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LaunchTemplateBody<'a> {
    name: &'a str,
    ami_id: &'a str,
    instance_type: &'a str,
    iam_instance_profile: Option<&'a str>,
    ssh_key_name: Option<&'a str>,
    security_group_ids: &'a [String],
    /// base64
    user_data: String,
    user_data_hash: &'a str,
    tags: &'a BTreeMap<String, String>,
}

impl<'a> From<&'a LaunchTemplateInput> for LaunchTemplateBody<'a> {
    fn from(input: &'a LaunchTemplateInput) -> Self {
        Self {
            name: &input.name,
            ami_id: &input.ami_id,
            instance_type: &input.instance_type,
            iam_instance_profile: input.iam_instance_profile.as_deref(),
            ssh_key_name: input.ssh_key_name.as_deref(),
            security_group_ids: &input.security_group_ids,
            user_data: STANDARD.encode(&input.user_data),
            user_data_hash: &input.user_data_hash,
            tags: &input.tags,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceRefreshState {
    in_progress: bool,
}

#[async_trait]
impl FleetGateway for HttpFleetGateway {
    async fn find_fleet(&self, name: &str) -> Result<Option<Fleet>, GatewayError> {
        self.optional(self.request(Method::GET, &["fleets", name]))
            .await
    }

    async fn create_fleet(&self, input: &FleetInput) -> Result<Fleet, GatewayError> {
        match self
            .json(self.request(Method::POST, &["fleets"]).json(input))
            .await
        {
            Err(GatewayError::Conflict(message)) => self
                .find_fleet(&input.name)
                .await?
                .ok_or(GatewayError::Conflict(message)),
            result => result,
        }
    }

    async fn update_fleet(&self, input: &FleetInput) -> Result<(), GatewayError> {
        self.send(self.request(Method::PUT, &["fleets", input.name.as_str()]).json(input))
            .await
            .map(|_| ())
    }

    async fn delete_fleet(&self, name: &str) -> Result<(), GatewayError> {
        self.idempotent_delete(self.request(Method::DELETE, &["fleets", name]))
            .await
    }

    async fn suspend_processes(
        &self,
        fleet: &str,
        processes: &[String],
    ) -> Result<(), GatewayError> {
        self.send(
            self.request(Method::POST, &["fleets", fleet, "suspend"])
                .json(&serde_json::json!({ "processes": processes })),
        )
        .await
        .map(|_| ())
    }

    async fn resume_processes(
        &self,
        fleet: &str,
        processes: &[String],
    ) -> Result<(), GatewayError> {
        self.send(
            self.request(Method::POST, &["fleets", fleet, "resume"])
                .json(&serde_json::json!({ "processes": processes })),
        )
        .await
        .map(|_| ())
    }

    async fn can_start_instance_refresh(&self, fleet: &str) -> Result<bool, GatewayError> {
        let state: InstanceRefreshState = self
            .json(self.request(Method::GET, &["fleets", fleet, "instance-refresh"]))
            .await?;
        Ok(!state.in_progress)
    }

    async fn start_instance_refresh(
        &self,
        fleet: &str,
        preferences: &RefreshPreferences,
    ) -> Result<RefreshOutcome, GatewayError> {
        match self
            .send(
                self.request(Method::POST, &["fleets", fleet, "instance-refresh"])
                    .json(preferences),
            )
            .await
        {
            Ok(_) => Ok(RefreshOutcome::Started),
            Err(GatewayError::Conflict(_)) => Ok(RefreshOutcome::AlreadyInProgress),
            Err(err) => Err(err),
        }
    }

    async fn find_launch_template(
        &self,
        name: &str,
    ) -> Result<Option<LaunchTemplate>, GatewayError> {
        self.optional(self.request(Method::GET, &["launch-templates", name]))
            .await
    }

    async fn create_launch_template(
        &self,
        input: &LaunchTemplateInput,
    ) -> Result<LaunchTemplate, GatewayError> {
        match self
            .json(
                self.request(Method::POST, &["launch-templates"])
                    .json(&LaunchTemplateBody::from(input)),
            )
            .await
        {
            Err(GatewayError::Conflict(message)) => self
                .find_launch_template(&input.name)
                .await?
                .ok_or(GatewayError::Conflict(message)),
            result => result,
        }
    }

    async fn create_launch_template_version(
        &self,
        id: &str,
        input: &LaunchTemplateInput,
    ) -> Result<LaunchTemplate, GatewayError> {
        self.json(
            self.request(Method::POST, &["launch-templates", id, "versions"])
                .json(&LaunchTemplateBody::from(input)),
        )
        .await
    }

    async fn prune_launch_template_versions(&self, id: &str) -> Result<(), GatewayError> {
        self.idempotent_delete(
            self.request(Method::DELETE, &["launch-templates", id, "versions"])
                .query(&[("select", "oldest-unused")]),
        )
        .await
    }

    async fn delete_launch_template(&self, id: &str) -> Result<(), GatewayError> {
        self.idempotent_delete(self.request(Method::DELETE, &["launch-templates", id]))
            .await
    }

    async fn instance_by_id(&self, id: &str) -> Result<Option<Instance>, GatewayError> {
        self.optional(self.request(Method::GET, &["instances", id]))
            .await
    }

    async fn update_resource_tags(
        &self,
        resource: &TaggedResource,
        create: &BTreeMap<String, String>,
        remove: &BTreeSet<String>,
    ) -> Result<(), GatewayError> {
        self.send(self.request(Method::POST, &["tags"]).json(&serde_json::json!({
            "resourceType": resource.kind(),
            "resourceId": resource.id(),
            "create": create,
            "delete": remove,
        })))
        .await
        .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_classification() {
        assert_eq!(
            classify(StatusCode::NOT_FOUND, String::new()),
            GatewayError::NotFound("404 Not Found".into())
        );
        assert!(matches!(
            classify(StatusCode::CONFLICT, "already deleting".into()),
            GatewayError::Conflict(m) if m == "409 Conflict: already deleting"
        ));
        assert!(classify(StatusCode::BAD_REQUEST, String::new()).is_rejected());
        assert!(classify(StatusCode::UNPROCESSABLE_ENTITY, String::new()).is_rejected());
        assert!(matches!(
            classify(StatusCode::TOO_MANY_REQUESTS, String::new()),
            GatewayError::Transient(_)
        ));
        assert!(matches!(
            classify(StatusCode::BAD_GATEWAY, String::new()),
            GatewayError::Transient(_)
        ));
    }

    #[test]
    fn path_segments_are_escaped_under_the_base_path() {
        let gateway =
            HttpFleetGateway::new(Url::parse("http://fleet-api:8080/v1/").unwrap(), None).unwrap();

        assert_eq!(
            gateway.url(&["fleets", "pool a", "suspend"]).as_str(),
            "http://fleet-api:8080/v1/fleets/pool%20a/suspend"
        );

        let gateway =
            HttpFleetGateway::new(Url::parse("http://fleet-api:8080/v1").unwrap(), None).unwrap();
        assert_eq!(
            gateway.url(&["instances", "i-123"]).as_str(),
            "http://fleet-api:8080/v1/instances/i-123"
        );
    }

    #[test]
    fn fleet_update_bodies_carry_no_tags() {
        let update = FleetInput {
            name: "pool-a".into(),
            launch_template_id: "lt-0a1b2c3d".into(),
            min_size: 1,
            max_size: 5,
            subnets: vec!["subnet-a".into()],
            ..Default::default()
        };
        let body = serde_json::to_value(&update).unwrap();
        assert_eq!(body.get("tags"), None);
        assert_eq!(body["launchTemplateId"], "lt-0a1b2c3d");

        let create = FleetInput {
            tags: Some(BTreeMap::from([("env".into(), "prod".into())])),
            ..update
        };
        assert_json_diff::assert_json_include!(
            actual: serde_json::to_value(&create).unwrap(),
            expected: serde_json::json!({ "tags": { "env": "prod" } })
        );
    }

    #[test]
    fn rejects_non_base_urls() {
        assert!(HttpFleetGateway::new(Url::parse("mailto:ops@example.com").unwrap(), None).is_err());
    }
}
