use fail::FailScenario;

/// Configures failpoints for the lifetime of the value and turns them off again on drop.
pub struct ScalingFailScenario<'a> {
    _scenario: FailScenario<'a>,
    failpoints: Vec<String>,
}

impl<'a> ScalingFailScenario<'a> {
    /// Sets each `(failpoint, action)` pair, for example `("importer.before_channel_ack",
    /// "1*return(transient)")`.
    pub fn setup(failpoints: &[(&str, &str)]) -> ScalingFailScenario<'a> {
        let scenario = FailScenario::setup();

        for (failpoint, action) in failpoints {
            fail::cfg(*failpoint, action).unwrap();
        }

        Self {
            _scenario: scenario,
            failpoints: failpoints
                .iter()
                .map(|(failpoint, _)| failpoint.to_string())
                .collect(),
        }
    }
}

impl Drop for ScalingFailScenario<'_> {
    fn drop(&mut self) {
        for failpoint in &self.failpoints {
            fail::remove(failpoint);
        }
    }
}
