use std::borrow::Cow;

use tabled::Tabled;

impl Tabled for crate::observer::v1::ServerStatusResponse {
    const LENGTH: usize = 4;

    fn fields(&self) -> Vec<std::borrow::Cow<'_, str>> {
        let fill = if self.max_flows == 0 {
            0.0
        } else {
            (self.num_flows as f64 / self.max_flows as f64) * 100.0
        };
        vec![
            Cow::Owned(self.num_flows.to_string()),
            Cow::Owned(self.max_flows.to_string()),
            Cow::Owned(format!("{:.2}%", fill)),
            Cow::Owned(self.seen_flows.to_string()),
        ]
    }

    fn headers() -> Vec<std::borrow::Cow<'static, str>> {
        vec![
            Cow::Borrowed("CURRENT FLOWS"),
            Cow::Borrowed("MAX FLOWS"),
            Cow::Borrowed("FILL"),
            Cow::Borrowed("SEEN FLOWS"),
        ]
    }
}
