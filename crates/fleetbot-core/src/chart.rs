//! QuickChart URL construction for `chart` replies.

use rand::Rng;
use serde_json::{json, Value};
use url::Url;

pub const QUICKCHART_URL: &str = "https://quickchart.io/chart";

const SEGMENT_COLORS: [&str; 6] = [
    "#28EB4F", "#ff6384", "#ffcd56", "#4bc0c0", "#9966ff", "#ff9f40",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChartKind {
    Pie,
    Doughnut,
    Bar,
    HorizontalBar,
}

impl ChartKind {
    /// Kinds an operator may ask for by name.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "pie" => Some(Self::Pie),
            "doughnut" => Some(Self::Doughnut),
            "bar" => Some(Self::Bar),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pie => "pie",
            Self::Doughnut => "doughnut",
            Self::Bar => "bar",
            Self::HorizontalBar => "horizontalBar",
        }
    }
}

/// One colour per label: the fixed palette first, random colours after it.
pub fn segment_colors(count: usize) -> Vec<String> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|i| match SEGMENT_COLORS.get(i) {
            Some(color) => (*color).to_string(),
            None => format!("#{:06x}", rng.gen_range(0..=0xFF_FFFFu32)),
        })
        .collect()
}

pub fn chart_config(kind: ChartKind, labels: &[String], counts: &[usize], title: &str) -> Value {
    let colors = segment_colors(labels.len());
    let (datasets, options) = match kind {
        ChartKind::Pie | ChartKind::Doughnut => (
            json!([{
                "data": counts,
                "backgroundColor": colors,
                "borderColor": "#fff",
                "borderWidth": 2,
            }]),
            json!({
                "title": {"display": true, "text": title},
                "responsive": true,
                "legend": {"position": "right"},
                "cutoutPercentage": if kind == ChartKind::Doughnut { 50 } else { 0 },
                "plugins": {"datalabels": {"color": "#fff", "font": {"weight": "bold"}}},
            }),
        ),
        ChartKind::HorizontalBar => (
            json!([{"data": counts, "backgroundColor": colors}]),
            json!({
                "title": {"display": true, "text": title},
                "scales": {
                    "xAxes": [{"gridLines": {"display": true, "drawOnChartArea": false, "tickMarkLength": 8}}],
                    "yAxes": [{"display": true, "position": "left", "gridLines": {"display": true, "drawOnChartArea": false}}],
                },
                "legend": {"display": false},
                "plugins": {
                    "datalabels": {
                        "anchor": "end",
                        "align": "end",
                        "color": "blue",
                        "font": {"size": 10, "weight": "bold"},
                    }
                },
            }),
        ),
        ChartKind::Bar => (
            json!([{"label": "Current", "data": counts, "backgroundColor": colors}]),
            json!({
                "title": {"display": true, "text": title},
                "scales": {"xAxes": [{"stacked": true}], "yAxes": [{"stacked": true}]},
                "plugins": {"roundedBars": true},
            }),
        ),
    };

    json!({
        "type": kind.as_str(),
        "data": {"labels": labels, "datasets": datasets},
        "options": options,
    })
}

/// Image URL for a chart of `labels` against `counts`.
pub fn chart_url(
    kind: ChartKind,
    labels: &[String],
    counts: &[usize],
    title: &str,
) -> Result<Url, url::ParseError> {
    let config = chart_config(kind, labels, counts, title).to_string();
    let mut params = vec![("c", config), ("bkg", "transparent".to_string())];
    if kind == ChartKind::HorizontalBar {
        params.push(("w", "800".to_string()));
        params.push(("h", "600".to_string()));
        params.push(("devicePixelRatio", "2".to_string()));
    }
    Url::parse_with_params(QUICKCHART_URL, &params)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("group-{}", i)).collect()
    }

    #[test]
    fn palette_comes_first() {
        let colors = segment_colors(8);
        assert_eq!(&colors[..6], &SEGMENT_COLORS.map(String::from));
        for extra in &colors[6..] {
            assert_eq!(extra.len(), 7);
            assert!(extra.starts_with('#'));
            assert!(u32::from_str_radix(&extra[1..], 16).is_ok());
        }
        assert_eq!(segment_colors(2).len(), 2);
    }

    #[test]
    fn doughnut_has_cutout() {
        let config = chart_config(ChartKind::Doughnut, &labels(2), &[3, 4], "Group comparison");
        assert_eq!(config["type"], "doughnut");
        assert_eq!(config["options"]["cutoutPercentage"], 50);
        assert_eq!(config["data"]["datasets"][0]["data"], json!([3, 4]));
        let pie = chart_config(ChartKind::Pie, &labels(2), &[3, 4], "Group comparison");
        assert_eq!(pie["options"]["cutoutPercentage"], 0);
    }

    #[test]
    fn url_carries_encoded_config() {
        let url = chart_url(
            ChartKind::HorizontalBar,
            &["MacBook Pro (16-inch, 2023)".to_string()],
            &[12],
            "Model comparison on request",
        )
        .expect("url");
        assert!(url.as_str().starts_with("https://quickchart.io/chart?c="));
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        let config: Value = serde_json::from_str(&pairs[0].1).expect("config json");
        assert_eq!(config["type"], "horizontalBar");
        assert_eq!(config["data"]["labels"][0], "MacBook Pro (16-inch, 2023)");
        assert!(pairs.contains(&("bkg".into(), "transparent".into())));
        assert!(pairs.contains(&("w".into(), "800".into())));
    }

    #[test]
    fn parses_requested_kinds() {
        assert_eq!(ChartKind::parse("PIE"), Some(ChartKind::Pie));
        assert_eq!(ChartKind::parse("bar"), Some(ChartKind::Bar));
        assert_eq!(ChartKind::parse("horizontalBar"), None);
        assert_eq!(ChartKind::parse("line"), None);
    }
}
