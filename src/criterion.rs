//! Criterion evaluation.
//!
//! A criterion is evaluated against one host through the protocol clients
//! and yields a match flag plus a human-readable message. Protocol failures
//! are non-matches. Every protocol-backed criterion holds the host's
//! serialization token while its request runs.

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::HostConfig;
use crate::connector::Criterion;
use crate::lines::psl_regex_multiline;
use crate::protocol::{HttpRequest, ProtocolClients, ProtocolError, ProtocolRequest};

/// Outcome of one criterion.
#[derive(Debug, Clone, PartialEq)]
pub struct CriterionResult {
    pub criterion: String,
    pub matched: bool,
    pub message: String,
    /// Protocol result the decision was based on.
    pub result: Option<String>,
}

impl CriterionResult {
    fn new(criterion: &Criterion, matched: bool, message: String, result: Option<String>) -> Self {
        Self {
            criterion: criterion.as_ref().to_string(),
            matched,
            message,
            result,
        }
    }
}

/// Outcome of a connector's criteria list.
#[derive(Debug, Clone, Default)]
pub struct DetectionOutcome {
    pub matched: bool,
    pub results: Vec<CriterionResult>,
}

impl DetectionOutcome {
    /// Message of the first failing criterion.
    pub fn failure_message(&self) -> Option<&str> {
        self.results
            .iter()
            .find(|r| !r.matched)
            .map(|r| r.message.as_str())
    }
}

/// How a text result is compared with an optional expected PSL regex.
enum Check {
    Matched,
    Empty,
    Mismatch,
    InvalidExpectation(String),
}

fn check(result: &str, expected: Option<&str>) -> Check {
    match expected {
        None if result.trim().is_empty() => Check::Empty,
        None => Check::Matched,
        Some(expected) => match psl_regex_multiline(expected) {
            Ok(re) if re.is_match(result) => Check::Matched,
            Ok(_) => Check::Mismatch,
            Err(e) => Check::InvalidExpectation(e.to_string()),
        },
    }
}

fn invalid_expectation(family: &str, error: &str) -> String {
    format!("{} Test Failed - invalid expected result: {}.", family, error)
}

fn expected_returned(expected: Option<&str>, result: &str) -> String {
    format!(
        "Expected value: {} - returned value {}.",
        expected.unwrap_or(""),
        result
    )
}

/// Evaluates criteria against one host.
#[derive(Clone, Copy)]
pub struct CriterionEvaluator<'a> {
    pub host: &'a HostConfig,
    pub clients: &'a ProtocolClients,
    pub serialization: &'a Mutex<()>,
    pub deadline: Option<Instant>,
}

impl<'a> CriterionEvaluator<'a> {
    /// AND of all criteria. Evaluation stops at the first failure, except
    /// for criteria flagged `forceSerialization`, which still run.
    pub async fn evaluate_all(&self, criteria: &[Criterion]) -> DetectionOutcome {
        if criteria.is_empty() {
            return DetectionOutcome {
                matched: false,
                results: Vec::new(),
            };
        }

        let mut outcome = DetectionOutcome {
            matched: true,
            results: Vec::with_capacity(criteria.len()),
        };
        for criterion in criteria {
            if !outcome.matched && !criterion.force_serialization() {
                continue;
            }
            let result = self.evaluate(criterion).await;
            outcome.matched &= result.matched;
            outcome.results.push(result);
        }
        outcome
    }

    pub async fn evaluate(&self, criterion: &Criterion) -> CriterionResult {
        let hostname = self.host.hostname.as_str();
        let result = match criterion {
            Criterion::DeviceType { keep_only, exclude } => {
                let kind = self.host.host_type;
                let matched = (keep_only.is_empty() || keep_only.contains(&kind))
                    && !exclude.contains(&kind);
                let message = if matched {
                    format!("Successful DeviceType Test: {} is a supported device type.", kind)
                } else {
                    format!("DeviceType Test Failed - {} is not a supported device type.", kind)
                };
                CriterionResult::new(criterion, matched, message, None)
            }

            Criterion::SnmpGet {
                oid,
                expected_result,
                ..
            } => {
                let request = ProtocolRequest::SnmpGet { oid: oid.clone() };
                match self.call(&request).await {
                    Err(e) => CriterionResult::new(
                        criterion,
                        false,
                        format!(
                            "SNMP Test Failed - SNMP Get of {} on {} was unsuccessful due to an exception. Message: {}.",
                            oid, hostname, e
                        ),
                        None,
                    ),
                    Ok(result) => {
                        let (matched, message) = match check(&result, expected_result.as_deref()) {
                            Check::Matched => (
                                true,
                                format!(
                                    "Successful SNMP Get of {} on {}. Returned Result: {}.",
                                    oid, hostname, result
                                ),
                            ),
                            Check::Empty => (
                                false,
                                format!(
                                    "SNMP Test Failed - SNMP Get of {} on {} was unsuccessful due to an empty result.",
                                    oid, hostname
                                ),
                            ),
                            Check::Mismatch => (
                                false,
                                format!(
                                    "SNMP Test Failed - SNMP Get of {} on {} was successful but the value of the returned OID did not match with the expected result. {}",
                                    oid,
                                    hostname,
                                    expected_returned(expected_result.as_deref(), &result)
                                ),
                            ),
                            Check::InvalidExpectation(e) => (false, invalid_expectation("SNMP", &e)),
                        };
                        CriterionResult::new(criterion, matched, message, Some(result))
                    }
                }
            }

            Criterion::SnmpGetNext {
                oid,
                expected_result,
                ..
            } => {
                let request = ProtocolRequest::SnmpGetNext { oid: oid.clone() };
                match self.call(&request).await {
                    Err(e) => CriterionResult::new(
                        criterion,
                        false,
                        format!(
                            "SNMP Test Failed - SNMP GetNext of {} on {} was unsuccessful due to an exception. Message: {}.",
                            oid, hostname, e
                        ),
                        None,
                    ),
                    Ok(result) => self.check_get_next(criterion, oid, expected_result.as_deref(), result),
                }
            }

            Criterion::Wbem {
                query,
                namespace,
                expected_result,
                ..
            }
            | Criterion::Wmi {
                query,
                namespace,
                expected_result,
                ..
            } => {
                let (family, request) = match criterion {
                    Criterion::Wbem { .. } => (
                        "WBEM",
                        ProtocolRequest::Wbem {
                            namespace: namespace.clone(),
                            query: query.clone(),
                        },
                    ),
                    _ => (
                        "WMI",
                        ProtocolRequest::Wmi {
                            namespace: namespace.clone(),
                            query: query.clone(),
                        },
                    ),
                };
                let namespace = namespace.as_deref().unwrap_or("default");
                match self.call(&request).await {
                    Err(e) => CriterionResult::new(
                        criterion,
                        false,
                        format!(
                            "{} Test Failed - {} Criterion query {} on {} was unsuccessful due to an exception. Message: {}.",
                            family, family, query, hostname, e
                        ),
                        None,
                    ),
                    Ok(result) => {
                        let (matched, message) = match check(&result, expected_result.as_deref()) {
                            Check::Matched => (
                                true,
                                format!(
                                    "Successful {} Test on {}:\n- query: {}\n- namespace: {}\n- result: {}",
                                    family, hostname, query, namespace, result
                                ),
                            ),
                            Check::Empty => (
                                false,
                                format!(
                                    "{} Test Failed - The following query succeeded but did not have any result:\n- query: {}\n- namespace: {}",
                                    family, query, namespace
                                ),
                            ),
                            Check::Mismatch => (
                                false,
                                format!(
                                    "{} Test Failed - The following query succeeded but its result did not match the expected output:\n- query: {}\n- namespace: {}\n- expected: {}\n- result: {}",
                                    family,
                                    query,
                                    namespace,
                                    expected_result.as_deref().unwrap_or(""),
                                    result
                                ),
                            ),
                            Check::InvalidExpectation(e) => (false, invalid_expectation(family, &e)),
                        };
                        CriterionResult::new(criterion, matched, message, Some(result))
                    }
                }
            }

            Criterion::Http {
                method,
                url,
                header,
                body,
                authentication_token,
                result_content,
                expected_result,
                ..
            } => {
                let request = ProtocolRequest::Http(HttpRequest {
                    method: *method,
                    url: url.clone(),
                    headers: header.clone(),
                    body: body.clone(),
                    authentication_token: authentication_token.clone(),
                    result_content: *result_content,
                });
                match self.call(&request).await {
                    Err(e) => CriterionResult::new(
                        criterion,
                        false,
                        format!(
                            "HTTP Test Failed - the HTTP Test on {} was unsuccessful due to an exception. Message: {}.",
                            hostname, e
                        ),
                        None,
                    ),
                    Ok(result) => {
                        let (matched, message) = match check(&result, expected_result.as_deref()) {
                            Check::Matched => (
                                true,
                                format!("Successful HTTP Test on {}. Returned Result: {}.", hostname, result),
                            ),
                            Check::Empty => (
                                false,
                                format!(
                                    "HTTP Test Failed - the HTTP Test on {} did not return any result.",
                                    hostname
                                ),
                            ),
                            Check::Mismatch => (
                                false,
                                format!(
                                    "HTTP Test Failed - the returned result ({}) of the HTTP Test on {} did not match the expected result ({}). {}",
                                    result,
                                    hostname,
                                    expected_result.as_deref().unwrap_or(""),
                                    expected_returned(expected_result.as_deref(), &result)
                                ),
                            ),
                            Check::InvalidExpectation(e) => (false, invalid_expectation("HTTP", &e)),
                        };
                        CriterionResult::new(criterion, matched, message, Some(result))
                    }
                }
            }

            Criterion::OsCommand {
                command_line,
                expected_result,
                execute_locally,
                timeout,
                error_message,
                ..
            } => {
                let request = ProtocolRequest::OsCommand {
                    command_line: command_line.clone(),
                    execute_locally: *execute_locally,
                    timeout: *timeout,
                };
                match self.call(&request).await {
                    Err(e) => CriterionResult::new(
                        criterion,
                        false,
                        error_message.clone().unwrap_or_else(|| {
                            format!(
                                "OSCommand Test Failed - the command {} on {} failed: {}.",
                                command_line, hostname, e
                            )
                        }),
                        None,
                    ),
                    Ok(result) => {
                        let outcome = match expected_result.as_deref() {
                            None => Check::Matched,
                            expected => check(&result, expected),
                        };
                        let (matched, message) = match outcome {
                            Check::Matched => (
                                true,
                                format!(
                                    "Successful OSCommand Test on {}. Returned Result: {}.",
                                    hostname,
                                    result.trim()
                                ),
                            ),
                            Check::InvalidExpectation(e) => (false, invalid_expectation("OSCommand", &e)),
                            Check::Empty | Check::Mismatch => (
                                false,
                                error_message.clone().unwrap_or_else(|| {
                                    format!(
                                        "OSCommand Test Failed - the result of {} on {} did not match the expected result. {}",
                                        command_line,
                                        hostname,
                                        expected_returned(expected_result.as_deref(), result.trim())
                                    )
                                }),
                            ),
                        };
                        CriterionResult::new(criterion, matched, message, Some(result))
                    }
                }
            }

            Criterion::Ipmi { .. } => match self.call(&ProtocolRequest::Ipmi).await {
                Ok(result) if !result.trim().is_empty() => CriterionResult::new(
                    criterion,
                    true,
                    format!("Successful IPMI Test on {}.", hostname),
                    Some(result),
                ),
                Ok(_) => CriterionResult::new(
                    criterion,
                    false,
                    format!("IPMI Test Failed - {} returned no IPMI data.", hostname),
                    None,
                ),
                Err(e) => CriterionResult::new(
                    criterion,
                    false,
                    format!("IPMI Test Failed - IPMI on {} was unsuccessful. Message: {}.", hostname, e),
                    None,
                ),
            },

            Criterion::Process { command_line } => self.check_process(criterion, command_line).await,

            Criterion::Service { name } => self.check_service(criterion, name).await,
        };

        tracing::debug!(
            host = %self.host.id,
            criterion = %result.criterion,
            matched = result.matched,
            "{}",
            result.message
        );
        result
    }

    /// Run a request under the serialization token and return its text.
    async fn call(&self, request: &ProtocolRequest) -> Result<String, ProtocolError> {
        let _guard = self.serialization.lock().await;
        let response = self
            .clients
            .execute(request, self.host, self.deadline)
            .await?;
        Ok(response.text())
    }

    /// GetNext results read `oid<TAB>type<TAB>value`. The returned OID must
    /// stay under the requested tree.
    fn check_get_next(
        &self,
        criterion: &Criterion,
        oid: &str,
        expected: Option<&str>,
        result: String,
    ) -> CriterionResult {
        let hostname = self.host.hostname.as_str();
        let fields: Vec<&str> = result.trim().split('\t').collect();
        let returned_oid = fields.first().copied().unwrap_or("");

        let (matched, message) = if result.trim().is_empty() {
            (
                false,
                format!(
                    "SNMP Test Failed - SNMP GetNext of {} on {} was unsuccessful due to an empty result.",
                    oid, hostname
                ),
            )
        } else if !returned_oid.trim_start_matches('.').starts_with(oid.trim_start_matches('.')) {
            (
                false,
                format!(
                    "SNMP Test Failed - SNMP GetNext of {} on {} was successful but the returned OID is not under the same tree. Returned OID: {}.",
                    oid, hostname, returned_oid
                ),
            )
        } else {
            match (expected, fields.get(2)) {
                (None, _) => (
                    true,
                    format!(
                        "Successful SNMP GetNext of {} on {}. Returned Result: {}.",
                        oid, hostname, result
                    ),
                ),
                (Some(_), None) => (
                    false,
                    format!(
                        "SNMP Test Failed - SNMP GetNext of {} on {} was successful but the value cannot be extracted. Returned Result: {}.",
                        oid, hostname, result
                    ),
                ),
                (Some(_), Some(value)) => match check(value, expected) {
                    Check::Matched => (
                        true,
                        format!(
                            "Successful SNMP GetNext of {} on {}. Returned Result: {}.",
                            oid, hostname, result
                        ),
                    ),
                    Check::InvalidExpectation(e) => (false, invalid_expectation("SNMP", &e)),
                    Check::Empty | Check::Mismatch => (
                        false,
                        format!(
                            "SNMP Test Failed - SNMP GetNext of {} on {} was successful but the value of the returned OID did not match with the expected result. {}",
                            oid,
                            hostname,
                            expected_returned(expected, value)
                        ),
                    ),
                },
            }
        };
        CriterionResult::new(criterion, matched, message, Some(result))
    }

    /// Match the command line column of the host's process list.
    async fn check_process(&self, criterion: &Criterion, command_line: &str) -> CriterionResult {
        let re = match psl_regex_multiline(command_line) {
            Ok(re) => re,
            Err(e) => {
                return CriterionResult::new(
                    criterion,
                    false,
                    invalid_expectation("Process", &e.to_string()),
                    None,
                );
            }
        };

        let _guard = self.serialization.lock().await;
        let rows = match self
            .clients
            .execute(&ProtocolRequest::ProcessList, self.host, self.deadline)
            .await
        {
            Ok(response) => response.into_table().into_rows(),
            Err(e) => {
                return CriterionResult::new(
                    criterion,
                    false,
                    format!("Process Test Failed - the process list of {} could not be read: {}.", self.host.hostname, e),
                    None,
                );
            }
        };

        match rows
            .iter()
            .find(|row| row.last().is_some_and(|args| re.is_match(args)))
        {
            Some(row) => CriterionResult::new(
                criterion,
                true,
                format!("Successful Process Test: a process matches {}.", command_line),
                Some(row.join(";")),
            ),
            None => CriterionResult::new(
                criterion,
                false,
                format!("Process Test Failed - no running process matches {}.", command_line),
                None,
            ),
        }
    }

    /// Query the service state through WMI.
    async fn check_service(&self, criterion: &Criterion, name: &str) -> CriterionResult {
        let hostname = self.host.hostname.as_str();
        if name.trim().is_empty() {
            return CriterionResult::new(
                criterion,
                false,
                "Service Test Failed - the service name is empty.".to_string(),
                None,
            );
        }

        let request = ProtocolRequest::Wmi {
            namespace: Some("root\\cimv2".to_string()),
            query: format!(
                "SELECT Name, State FROM Win32_Service WHERE Name = '{}'",
                name.replace('\'', "\\'")
            ),
        };
        let rows = {
            let _guard = self.serialization.lock().await;
            match self.clients.execute(&request, self.host, self.deadline).await {
                Ok(response) => response.into_table().into_rows(),
                Err(e) => {
                    return CriterionResult::new(
                        criterion,
                        false,
                        format!("Service Test Failed - the services of {} could not be queried: {}.", hostname, e),
                        None,
                    );
                }
            }
        };

        let running = rows
            .iter()
            .any(|row| row.get(1).is_some_and(|state| state.trim().eq_ignore_ascii_case("running")));
        if running {
            CriterionResult::new(
                criterion,
                true,
                format!("Successful Service Test: {} is running on {}.", name, hostname),
                None,
            )
        } else if rows.is_empty() {
            CriterionResult::new(
                criterion,
                false,
                format!("Service Test Failed - {} is not installed on {}.", name, hostname),
                None,
            )
        } else {
            CriterionResult::new(
                criterion,
                false,
                format!("Service Test Failed - {} is not running on {}.", name, hostname),
                None,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtocolConfig;
    use crate::connector::DeviceKind;
    use crate::protocol::ProtocolKind;
    use crate::testing::ScriptedClient;
    use std::sync::Arc;
    use std::time::Duration;

    struct Fixture {
        host: HostConfig,
        clients: ProtocolClients,
        client: Arc<ScriptedClient>,
        lock: Mutex<()>,
    }

    impl Fixture {
        fn new(client: ScriptedClient) -> Self {
            let client = Arc::new(client);
            let host = HostConfig::new("h1", "server-01")
                .with_host_type(DeviceKind::Windows)
                .with_protocol(ProtocolKind::Snmp, ProtocolConfig::default())
                .with_protocol(ProtocolKind::Wmi, ProtocolConfig::default())
                .with_protocol(ProtocolKind::Http, ProtocolConfig::default());
            let clients = ProtocolClients::new()
                .with_client(ProtocolKind::Snmp, client.clone())
                .with_client(ProtocolKind::Wmi, client.clone())
                .with_client(ProtocolKind::Http, client.clone());
            Self {
                host,
                clients,
                client,
                lock: Mutex::new(()),
            }
        }

        fn evaluator(&self) -> CriterionEvaluator<'_> {
            CriterionEvaluator {
                host: &self.host,
                clients: &self.clients,
                serialization: &self.lock,
                deadline: None,
            }
        }
    }

    fn snmp_get(oid: &str, expected: Option<&str>, force: bool) -> Criterion {
        Criterion::SnmpGet {
            oid: oid.into(),
            expected_result: expected.map(str::to_string),
            force_serialization: force,
        }
    }

    // ==================== Single criteria ====================

    #[tokio::test]
    async fn test_snmp_get_expected_result() {
        let fixture = Fixture::new(ScriptedClient::new().respond("snmpGet 1.3.6.1.4.1.232", "Compaq ProLiant"));
        let evaluator = fixture.evaluator();

        let result = evaluator.evaluate(&snmp_get("1.3.6.1.4.1.232", Some("^compaq"), false)).await;
        assert!(result.matched, "{}", result.message);
        assert_eq!(
            result.message,
            "Successful SNMP Get of 1.3.6.1.4.1.232 on server-01. Returned Result: Compaq ProLiant."
        );

        let result = evaluator.evaluate(&snmp_get("1.3.6.1.4.1.232", Some("dell"), false)).await;
        assert!(!result.matched);
        assert!(result.message.starts_with("SNMP Test Failed"));
    }

    #[tokio::test]
    async fn test_protocol_error_is_non_match() {
        let fixture = Fixture::new(ScriptedClient::new().fail("snmpGet 1.3", "timeout"));
        let result = fixture.evaluator().evaluate(&snmp_get("1.3", None, false)).await;
        assert!(!result.matched);
        assert!(result.message.contains("due to an exception"));
    }

    #[tokio::test]
    async fn test_snmp_get_next_tree() {
        let fixture = Fixture::new(
            ScriptedClient::new()
                .respond("snmpGetNext 1.3.6.1.4.1.674", "1.3.6.1.4.1.674.10892.1\tASN_OCTET_STR\tDell"),
        );
        let evaluator = fixture.evaluator();

        let criterion = Criterion::SnmpGetNext {
            oid: "1.3.6.1.4.1.674".into(),
            expected_result: Some("dell".into()),
            force_serialization: false,
        };
        assert!(evaluator.evaluate(&criterion).await.matched);

        let criterion = Criterion::SnmpGetNext {
            oid: "1.3.6.1.4.1.9.".into(),
            expected_result: None,
            force_serialization: false,
        };
        let fixture = Fixture::new(
            ScriptedClient::new().respond("snmpGetNext 1.3.6.1.4.1.9.", "1.3.6.1.4.1.99.1\tASN_INTEGER\t1"),
        );
        let result = fixture.evaluator().evaluate(&criterion).await;
        assert!(!result.matched);
        assert!(result.message.contains("not under the same tree"));
    }

    #[tokio::test]
    async fn test_http_without_expected_result() {
        let fixture = Fixture::new(
            ScriptedClient::new()
                .respond("http GET /redfish/v1", "{}")
                .respond("http GET /empty", ""),
        );
        let evaluator = fixture.evaluator();
        let http = |url: &str| Criterion::Http {
            method: Default::default(),
            url: url.into(),
            header: Default::default(),
            body: None,
            authentication_token: None,
            result_content: Default::default(),
            expected_result: None,
            force_serialization: false,
        };

        assert!(evaluator.evaluate(&http("/redfish/v1")).await.matched);
        let result = evaluator.evaluate(&http("/empty")).await;
        assert!(!result.matched);
        assert!(result.message.contains("did not return any result"));
    }

    #[tokio::test]
    async fn test_http_unreachable_never_matches() {
        let fixture = Fixture::new(ScriptedClient::new().fail("http GET /status", "connection refused"));
        let criterion = Criterion::Http {
            method: Default::default(),
            url: "/status".into(),
            header: Default::default(),
            body: None,
            authentication_token: None,
            result_content: Default::default(),
            expected_result: Some("^$".into()),
            force_serialization: false,
        };

        let result = fixture.evaluator().evaluate(&criterion).await;
        assert!(!result.matched, "{}", result.message);
        assert!(result.message.starts_with("HTTP Test Failed"));
        assert!(result.message.contains("connection refused"));
        assert!(result.result.is_none());
    }

    #[tokio::test]
    async fn test_wmi_result_rows() {
        let fixture = Fixture::new(
            ScriptedClient::new().respond_rows("wmi - SELECT Manufacturer FROM Win32_ComputerSystem", &[&["HP"]]),
        );
        let criterion = Criterion::Wmi {
            query: "SELECT Manufacturer FROM Win32_ComputerSystem".into(),
            namespace: None,
            expected_result: Some("^HP;".into()),
            force_serialization: false,
        };
        let result = fixture.evaluator().evaluate(&criterion).await;
        assert!(result.matched, "{}", result.message);
        assert_eq!(result.result.as_deref(), Some("HP;"));
    }

    #[tokio::test]
    async fn test_device_type() {
        let fixture = Fixture::new(ScriptedClient::new());
        let evaluator = fixture.evaluator();
        let keep = Criterion::DeviceType {
            keep_only: vec![DeviceKind::Windows],
            exclude: vec![],
        };
        let exclude = Criterion::DeviceType {
            keep_only: vec![],
            exclude: vec![DeviceKind::Windows],
        };
        assert!(evaluator.evaluate(&keep).await.matched);
        assert!(!evaluator.evaluate(&exclude).await.matched);
    }

    #[tokio::test]
    async fn test_service_state() {
        let query = "wmi root\\cimv2 SELECT Name, State FROM Win32_Service WHERE Name = 'snmp'";
        let fixture = Fixture::new(ScriptedClient::new().respond_rows(query, &[&["SNMP", "Running"]]));
        let result = fixture
            .evaluator()
            .evaluate(&Criterion::Service { name: "snmp".into() })
            .await;
        assert!(result.matched, "{}", result.message);

        let fixture = Fixture::new(ScriptedClient::new().respond_rows(query, &[&["SNMP", "Stopped"]]));
        let result = fixture
            .evaluator()
            .evaluate(&Criterion::Service { name: "snmp".into() })
            .await;
        assert!(result.message.contains("is not running"));
    }

    #[tokio::test]
    async fn test_process_list() {
        let fixture = Fixture::new(ScriptedClient::new().respond_rows(
            "processList",
            &[&["1", "init", "/sbin/init"], &["77", "java", "java -jar hpsmhd.jar"]],
        ));
        let evaluator = fixture.evaluator();
        assert!(evaluator.evaluate(&Criterion::Process { command_line: "hpsmhd".into() }).await.matched);
        assert!(!evaluator.evaluate(&Criterion::Process { command_line: "^dsm_sa".into() }).await.matched);
    }

    // ==================== Criteria lists ====================

    #[tokio::test]
    async fn test_evaluate_all_short_circuits() {
        let fixture = Fixture::new(ScriptedClient::new().respond("snmpGet 2", "x").respond("snmpGet 3", "y"));
        let outcome = fixture
            .evaluator()
            .evaluate_all(&[
                snmp_get("1", None, false),
                snmp_get("2", None, false),
                snmp_get("3", None, true),
            ])
            .await;

        assert!(!outcome.matched);
        assert_eq!(fixture.client.call_count("snmpGet 1"), 1);
        assert_eq!(fixture.client.call_count("snmpGet 2"), 0);
        // Forced criteria still run after a failure.
        assert_eq!(fixture.client.call_count("snmpGet 3"), 1);
        assert_eq!(outcome.results.len(), 2);
        assert!(outcome.failure_message().unwrap().contains("SNMP Get of 1 on"));
    }

    #[tokio::test]
    async fn test_evaluate_all_matches_and_empty_list() {
        let fixture = Fixture::new(ScriptedClient::new().respond("snmpGet 1", "x"));
        let evaluator = fixture.evaluator();
        assert!(evaluator.evaluate_all(&[snmp_get("1", None, false)]).await.matched);
        assert!(!evaluator.evaluate_all(&[]).await.matched);
    }

    #[tokio::test]
    async fn test_criteria_do_not_overlap() {
        let fixture = Fixture::new(
            ScriptedClient::new()
                .with_delay(Duration::from_millis(20))
                .respond("snmpGet 1", "a")
                .respond("snmpGet 2", "b"),
        );
        let evaluator = fixture.evaluator();
        let first = snmp_get("1", None, false);
        let second = snmp_get("2", None, false);
        let (a, b) = tokio::join!(evaluator.evaluate(&first), evaluator.evaluate(&second));
        assert!(a.matched && b.matched);

        let calls = fixture.client.calls();
        assert_eq!(calls.len(), 2);
        let (x, y) = (&calls[0], &calls[1]);
        assert!(x.finished <= y.started || y.finished <= x.started);
    }
}
