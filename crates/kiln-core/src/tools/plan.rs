//! Ordered conversion strategies per `(category, from, to)`.
//!
//! Each strategy is a short pipeline of tool invocations. The adapter tries
//! at most two strategies per request, primary first.

use std::collections::BTreeMap;

use super::Tool;
use crate::error::ConvertError;
use crate::format::{Category, Format};

/// One argument in a step's command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    Lit(&'static str),
    Owned(String),
    /// Path of this step's input file.
    Input,
    /// Path of this step's output file.
    Output,
    /// Directory the step's output is written into.
    OutDir,
}

/// A single tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub tool: Tool,
    pub args: Vec<Arg>,
    /// File name the step is expected to produce inside the output directory.
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Strategy {
    pub name: &'static str,
    pub steps: Vec<Step>,
}

impl Strategy {
    fn single(name: &'static str, step: Step) -> Self {
        Self { name, steps: vec![step] }
    }

    pub fn tools(&self) -> impl Iterator<Item = Tool> + '_ {
        self.steps.iter().map(|s| s.tool)
    }
}

const PANDOC_READS: &[&str] = &["docx", "odt", "html", "md", "txt", "rtf", "epub"];
const PANDOC_WRITES: &[&str] = &["docx", "odt", "html", "md", "txt", "rtf", "epub", "pdf"];
const POSTSCRIPT: &[&str] = &["eps", "ps"];

/// Plan the strategies for a conversion, primary first.
pub fn plan(
    category: Category,
    from: &Format,
    to: &Format,
    options: &BTreeMap<String, String>,
) -> Result<Vec<Strategy>, ConvertError> {
    let strategies = match category {
        Category::Document => document(from, to),
        Category::Vector => vector(from, to),
        Category::Image => image(from, to, options),
    };
    if strategies.is_empty() {
        return Err(ConvertError::BadRequest(format!(
            "no {category} converter for {from} -> {to}"
        )));
    }
    Ok(strategies)
}

fn out_name(to: &Format) -> String {
    format!("input.{}", to.extension())
}

fn document(from: &Format, to: &Format) -> Vec<Strategy> {
    let mut strategies = vec![Strategy::single(
        "libreoffice",
        Step {
            tool: Tool::Soffice,
            args: vec![
                Arg::Lit("--headless"),
                Arg::Lit("--convert-to"),
                Arg::Owned(to.extension().to_owned()),
                Arg::Lit("--outdir"),
                Arg::OutDir,
                Arg::Input,
            ],
            output: out_name(to),
        },
    )];

    if PANDOC_READS.contains(&from.as_str()) && PANDOC_WRITES.contains(&to.as_str()) {
        let mut args = Vec::new();
        if from.as_str() == "txt" {
            args.extend([Arg::Lit("-f"), Arg::Lit("markdown")]);
        }
        if to.as_str() == "txt" {
            args.extend([Arg::Lit("-t"), Arg::Lit("plain")]);
        }
        args.extend([Arg::Lit("-o"), Arg::Output, Arg::Input]);
        strategies.push(Strategy::single(
            "pandoc",
            Step { tool: Tool::Pandoc, args, output: out_name(to) },
        ));
    }
    strategies
}

fn vector(from: &Format, to: &Format) -> Vec<Strategy> {
    let mut strategies = vec![Strategy::single(
        "inkscape",
        Step {
            tool: Tool::Inkscape,
            args: vec![
                Arg::Input,
                Arg::Owned(format!("--export-type={}", to.extension())),
                Arg::Lit("--export-filename"),
                Arg::Output,
            ],
            output: out_name(to),
        },
    )];

    let from_ps = POSTSCRIPT.contains(&from.as_str());
    let fallback = match (from.as_str(), to.as_str()) {
        ("svg", "pdf" | "png" | "eps" | "ps") => Some(Strategy::single(
            "rsvg-convert",
            Step {
                tool: Tool::RsvgConvert,
                args: vec![
                    Arg::Lit("-f"),
                    Arg::Owned(to.as_str().to_owned()),
                    Arg::Lit("-o"),
                    Arg::Output,
                    Arg::Input,
                ],
                output: out_name(to),
            },
        )),
        ("pdf", "svg") => Some(Strategy::single("pdftocairo", pdftocairo_svg(to))),
        (_, "svg") if from_ps => Some(Strategy {
            name: "ghostscript+pdftocairo",
            steps: vec![ghostscript("pdfwrite", "stage.pdf"), pdftocairo_svg(to)],
        }),
        (_, "pdf") if from_ps => Some(Strategy::single(
            "ghostscript",
            ghostscript("pdfwrite", &out_name(to)),
        )),
        ("pdf" | "eps" | "ps", "png") => Some(Strategy::single(
            "ghostscript",
            ghostscript("png16m", &out_name(to)),
        )),
        ("pdf", "eps") => Some(Strategy::single(
            "ghostscript",
            ghostscript("eps2write", &out_name(to)),
        )),
        _ => None,
    };
    strategies.extend(fallback);
    strategies
}

fn ghostscript(device: &str, output: &str) -> Step {
    Step {
        tool: Tool::Ghostscript,
        args: vec![
            Arg::Lit("-dSAFER"),
            Arg::Lit("-dBATCH"),
            Arg::Lit("-dNOPAUSE"),
            Arg::Lit("-dQUIET"),
            Arg::Lit("-dFirstPage=1"),
            Arg::Lit("-dLastPage=1"),
            Arg::Lit("-r150"),
            Arg::Owned(format!("-sDEVICE={device}")),
            Arg::Lit("-o"),
            Arg::Output,
            Arg::Input,
        ],
        output: output.to_owned(),
    }
}

fn pdftocairo_svg(to: &Format) -> Step {
    Step {
        tool: Tool::PdfToCairo,
        args: vec![Arg::Lit("-svg"), Arg::Input, Arg::Output],
        output: out_name(to),
    }
}

fn image(_from: &Format, to: &Format, options: &BTreeMap<String, String>) -> Vec<Strategy> {
    let mut args = vec![Arg::Input];
    match (options.get("width"), options.get("height")) {
        (None, None) => {}
        (w, h) => {
            let geometry = format!(
                "{}x{}",
                w.map(String::as_str).unwrap_or(""),
                h.map(String::as_str).unwrap_or("")
            );
            args.extend([Arg::Lit("-resize"), Arg::Owned(geometry)]);
        }
    }
    if let Some(q) = options.get("quality") {
        args.extend([Arg::Lit("-quality"), Arg::Owned(q.clone())]);
    }
    args.push(Arg::Output);

    [Tool::Magick, Tool::ImageMagickLegacy]
        .into_iter()
        .map(|tool| {
            Strategy::single(
                if tool == Tool::Magick { "imagemagick" } else { "imagemagick-legacy" },
                Step { tool, args: args.clone(), output: out_name(to) },
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fmt(s: &str) -> Format {
        Format::parse(s).unwrap()
    }

    fn names(strategies: &[Strategy]) -> Vec<&'static str> {
        strategies.iter().map(|s| s.name).collect()
    }

    #[test]
    fn documents_fall_back_to_pandoc_when_it_can_read_the_source() {
        let none = BTreeMap::new();
        let docx = plan(Category::Document, &fmt("docx"), &fmt("pdf"), &none).unwrap();
        assert_eq!(names(&docx), ["libreoffice", "pandoc"]);

        let doc = plan(Category::Document, &fmt("doc"), &fmt("pdf"), &none).unwrap();
        assert_eq!(names(&doc), ["libreoffice"]);
    }

    #[test]
    fn eps_to_svg_fallback_is_two_stage() {
        let plan = plan(Category::Vector, &fmt("eps"), &fmt("svg"), &BTreeMap::new()).unwrap();
        assert_eq!(plan.len(), 2);
        let fallback = &plan[1];
        let tools: Vec<Tool> = fallback.tools().collect();
        assert_eq!(tools, [Tool::Ghostscript, Tool::PdfToCairo]);
        assert_eq!(fallback.steps[0].output, "stage.pdf");
        assert_eq!(fallback.steps[1].output, "input.svg");
    }

    #[test]
    fn never_more_than_two_strategies() {
        let none = BTreeMap::new();
        for category in [Category::Document, Category::Vector, Category::Image] {
            for from in category.known_formats() {
                for to in category.known_formats() {
                    let p = plan(category, &fmt(from), &fmt(to), &none).unwrap();
                    assert!((1..=2).contains(&p.len()), "{category} {from}->{to}");
                }
            }
        }
    }

    #[test]
    fn image_options_become_magick_flags() {
        let mut opts = BTreeMap::new();
        opts.insert("width".to_owned(), "320".to_owned());
        opts.insert("quality".to_owned(), "70".to_owned());
        let plan = plan(Category::Image, &fmt("png"), &fmt("avif"), &opts).unwrap();
        let args = &plan[0].steps[0].args;
        assert!(args.contains(&Arg::Owned("320x".into())));
        assert!(args.contains(&Arg::Owned("70".into())));
        assert_eq!(args.last(), Some(&Arg::Output));
    }
}
