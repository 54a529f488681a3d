use crate::types::{GroupBy, GroupCount};
use anyhow::{Result, anyhow};
use plotters::prelude::*;

const WIDTH: u32 = 900;
const HEIGHT: u32 = 480;

pub fn chart_title(group: GroupBy) -> &'static str {
    match group {
        GroupBy::Province => "Occurrences by province",
        GroupBy::Canton => "Occurrences by canton",
    }
}

/// Bar chart of `rows` (already sorted highest first) as an SVG document.
pub fn bar_chart_svg(rows: &[GroupCount], group: GroupBy, bar_color: &str) -> Result<String> {
    let color = hex_to_rgb(bar_color);
    let labels: Vec<String> = rows.iter().map(|r| r.label.clone()).collect();
    let max = rows.iter().map(|r| r.count).max().unwrap_or(0).max(1);
    // At least one slot so an empty chart still has axes
    let slots = rows.len().max(1);

    let mut svg = String::new();
    {
        let root = SVGBackend::with_string(&mut svg, (WIDTH, HEIGHT)).into_drawing_area();
        root.fill(&WHITE).map_err(|e| anyhow!("Failed to draw chart: {:?}", e))?;

        let mut chart = ChartBuilder::on(&root)
            .caption(chart_title(group), ("sans-serif", 22))
            .margin(12)
            .x_label_area_size(110)
            .y_label_area_size(60)
            .build_cartesian_2d((0..slots).into_segmented(), 0u64..max + max / 10 + 1)
            .map_err(|e| anyhow!("Failed to build chart: {:?}", e))?;

        let x_desc = match group {
            GroupBy::Province => "Province",
            GroupBy::Canton => "Canton",
        };

        chart
            .configure_mesh()
            .disable_x_mesh()
            .x_labels(slots)
            .x_label_formatter(&|v| match v {
                SegmentValue::CenterOf(i) => labels.get(*i).cloned().unwrap_or_default(),
                _ => String::new(),
            })
            .x_label_style(("sans-serif", 12).into_font().transform(FontTransform::Rotate90))
            .x_desc(x_desc)
            .y_desc("Occurrence records")
            .draw()
            .map_err(|e| anyhow!("Failed to draw axes: {:?}", e))?;

        chart
            .draw_series(rows.iter().enumerate().map(|(i, row)| {
                let mut bar = Rectangle::new(
                    [(SegmentValue::Exact(i), 0), (SegmentValue::Exact(i + 1), row.count)],
                    color.filled(),
                );
                bar.set_margin(0, 0, 4, 4);
                bar
            }))
            .map_err(|e| anyhow!("Failed to draw bars: {:?}", e))?;

        root.present().map_err(|e| anyhow!("Failed to finish chart: {:?}", e))?;
    }

    Ok(svg)
}

fn hex_to_rgb(hex: &str) -> RGBColor {
    let hex = hex.trim_start_matches('#');
    let channel = |range: std::ops::Range<usize>| {
        hex.get(range).and_then(|h| u8::from_str_radix(h, 16).ok()).unwrap_or(0)
    };
    RGBColor(channel(0..2), channel(2..4), channel(4..6))
}
