//! Stock capabilities. Sources are expressions over the engine's `host`
//! runtime (see `engine/host.js`).
use super::Capability;

const RECHARTS_COMPONENTS: &[&str] = &[
    "ResponsiveContainer",
    "LineChart",
    "Line",
    "BarChart",
    "Bar",
    "AreaChart",
    "Area",
    "PieChart",
    "Pie",
    "Cell",
    "ScatterChart",
    "Scatter",
    "RadarChart",
    "Radar",
    "PolarGrid",
    "PolarAngleAxis",
    "PolarRadiusAxis",
    "ComposedChart",
    "XAxis",
    "YAxis",
    "CartesianGrid",
    "Tooltip",
    "Legend",
    "Label",
    "LabelList",
];

const MERMAID_SOURCE: &str = r#"(() => {
    const DIAGRAMS = ["graph", "flowchart", "sequenceDiagram", "classDiagram",
        "stateDiagram", "erDiagram", "gantt", "pie", "journey", "gitGraph", "mindmap", "timeline"];
    const kindOf = (text) => {
        const head = String(text).trim().split(/\s+/)[0] || "";
        return DIAGRAMS.find((d) => head === d || head.startsWith(d + "-")) || null;
    };
    let settings = {};
    return {
        initialize: (config) => { settings = Object.assign({}, config); },
        parse: (text) => {
            if (!kindOf(text)) throw new Error("No diagram type detected for text");
            return true;
        },
        render: (id, text) => {
            const kind = kindOf(text);
            if (!kind) return Promise.reject(new Error("No diagram type detected for text"));
            const theme = settings.theme || "default";
            return Promise.resolve({
                svg: `<svg id="${String(id)}" data-diagram="${kind}" data-theme="${theme}"></svg>`,
            });
        },
    };
})()"#;

fn recharts_source() -> String {
    let names: Vec<String> = RECHARTS_COMPONENTS
        .iter()
        .map(|name| format!("\"{name}\""))
        .collect();
    format!("host.components([{}])", names.join(", "))
}

pub fn capabilities() -> Vec<Capability> {
    vec![
        Capability::new("React", "host.react").importable_as("react"),
        Capability::new("ReactIcons", "host.icons()").importable_as("react-icons"),
        Capability::new("Recharts", &recharts_source()).importable_as("recharts"),
        Capability::new("Mermaid", MERMAID_SOURCE).importable_as("mermaid"),
        Capability::new("ReactMarkdown", "host.component(\"ReactMarkdown\")")
            .importable_as("react-markdown"),
        Capability::new("remarkGfm", "(function remarkGfm() {})").importable_as("remark-gfm"),
    ]
}
