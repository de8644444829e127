//! Free-chunk extraction from glibc's `malloc_info()` XML report.
//!
//! The report does not list free chunks one by one. Per heap it gives one
//! entry per non-empty bin, plus the heap totals:
//!
//! ```plaintext
//! <heap nr="0">
//! <sizes>
//!   <size from="1041" to="1553" total="4146" count="3"/>
//!   <unsorted from="529" to="529" total="529" count="1"/>
//! </sizes>
//! <total type="fast" count="0" size="0"/>
//! <total type="rest" count="5" size="139289"/>
//! ...
//! </heap>
//! ```
//!
//! `from` and `to` are the smallest and largest chunk actually seen in the
//! bin, so a bin with `count >= 2` holds one chunk of `to`, one of `from`, and
//! `count - 2` chunks in between that share the rest of `total`. Fastbin
//! lines are the exception: every chunk in a fastbin has the same size, and
//! glibc reports it as `to` with `total = count * to`. The top chunk
//! is never binned; it is what `rest` has left over once the binned chunks
//! that are not fastbin chunks are taken out.
//!
//! Parsing walks the text in place and never allocates, so it is safe to run
//! while measuring the allocator that produced the report.

use super::IntrospectionError;

/// One bin line of the report
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BinEntry {
    pub from: usize,
    pub to: usize,
    pub total: usize,
    pub count: usize,
}

impl BinEntry {
    fn validate(&self) -> Result<(), IntrospectionError> {
        if self.count == 0 {
            return if self.total == 0 {
                Ok(())
            } else {
                Err(IntrospectionError::Malformed("empty bin with non-zero total"))
            };
        }
        if self.count == 1 || self.is_uniform() {
            return Ok(());
        }
        let bounds = self
            .from
            .checked_mul(self.count - 1)
            .and_then(|low| low.checked_add(self.to))
            .zip(
                self.to
                    .checked_mul(self.count - 1)
                    .and_then(|high| high.checked_add(self.from)),
            );
        match bounds {
            Some((low, high)) if self.from <= self.to && low <= self.total && self.total <= high => {
                Ok(())
            }
            _ => Err(IntrospectionError::Malformed("bin total outside its size bounds")),
        }
    }

    fn is_uniform(&self) -> bool {
        self.to.checked_mul(self.count) == Some(self.total)
    }

    /// Reconstruct the bin's chunk sizes. The sum is exactly `total` and no
    /// chunk is larger than `to`.
    pub fn for_each_chunk(&self, visit: &mut dyn FnMut(usize)) {
        match self.count {
            0 => {}
            1 => visit(self.total),
            count if self.is_uniform() => {
                for _ in 0..count {
                    visit(self.to);
                }
            }
            count => {
                visit(self.to);
                visit(self.from);
                let middle = count - 2;
                if middle == 0 {
                    return;
                }
                let rest = self.total - self.to - self.from;
                let (base, extra) = (rest / middle, rest % middle);
                for i in 0..middle {
                    visit(base + usize::from(i < extra));
                }
            }
        }
    }
}

/// Visit every free chunk described by `report`, bins first, then the top
/// chunk, heap by heap.
///
/// # Errors
/// - [`IntrospectionError::Malformed`] if the report is truncated, has no
///   heaps, or carries numbers that are missing or inconsistent. Chunks of
///   heaps before the bad one may already have been visited.
pub fn parse_report(report: &str, visit: &mut dyn FnMut(usize)) -> Result<(), IntrospectionError> {
    if !report.trim_end().ends_with("</malloc>") {
        return Err(IntrospectionError::Malformed("report is truncated"));
    }
    let mut rest = report;
    let mut heaps = 0usize;
    while let Some(start) = rest.find("<heap ") {
        let body = &rest[start..];
        let end = body
            .find("</heap>")
            .ok_or(IntrospectionError::Malformed("unterminated heap section"))?;
        parse_heap(&body[..end], visit)?;
        heaps += 1;
        rest = &body[end..];
    }
    if heaps == 0 {
        return Err(IntrospectionError::Malformed("no heap sections"));
    }
    Ok(())
}

fn parse_heap(section: &str, visit: &mut dyn FnMut(usize)) -> Result<(), IntrospectionError> {
    let mut binned = 0usize;
    let mut fast = None;
    let mut avail = None;
    for tag in tags(section) {
        match tag_name(tag) {
            "size" | "unsorted" => {
                let bin = BinEntry {
                    from: number(tag, "from")?,
                    to: number(tag, "to")?,
                    total: number(tag, "total")?,
                    count: number(tag, "count")?,
                };
                bin.validate()?;
                bin.for_each_chunk(visit);
                binned = binned
                    .checked_add(bin.total)
                    .ok_or(IntrospectionError::Malformed("binned total overflows"))?;
            }
            "total" => match attribute(tag, "type") {
                Some("fast") => fast = Some(number(tag, "size")?),
                Some("rest") => avail = Some(number(tag, "size")?),
                _ => {}
            },
            _ => {}
        }
    }
    let (Some(fast), Some(avail)) = (fast, avail) else {
        return Err(IntrospectionError::Malformed("heap section without totals"));
    };
    let top = binned
        .checked_sub(fast)
        .and_then(|normal| avail.checked_sub(normal))
        .ok_or(IntrospectionError::Malformed("heap totals disagree with bins"))?;
    if top > 0 {
        visit(top);
    }
    Ok(())
}

/// The contents of every `<...>` in `text`, without the brackets
fn tags(text: &str) -> impl Iterator<Item = &str> {
    text.split('<')
        .skip(1)
        .filter_map(|chunk| chunk.split_once('>').map(|(tag, _)| tag))
}

fn tag_name(tag: &str) -> &str {
    tag.split(|c: char| c.is_ascii_whitespace() || c == '/')
        .next()
        .unwrap_or("")
}

fn attribute<'a>(tag: &'a str, name: &str) -> Option<&'a str> {
    let mut rest = tag;
    while let Some(at) = rest.find(name) {
        let preceded_by_space = rest[..at].ends_with(|c: char| c.is_ascii_whitespace());
        let after = &rest[at + name.len()..];
        if preceded_by_space {
            if let Some(value) = after.strip_prefix("=\"") {
                return value.split_once('"').map(|(value, _)| value);
            }
        }
        rest = after;
    }
    None
}

fn number(tag: &str, name: &str) -> Result<usize, IntrospectionError> {
    attribute(tag, name)
        .ok_or(IntrospectionError::Malformed("missing attribute"))?
        .parse()
        .map_err(|_| IntrospectionError::Malformed("attribute is not a number"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const REPORT: &str = r#"<malloc version="1">
<heap nr="0">
<sizes>
  <size from="1041" to="1553" total="4146" count="3"/>
  <size from="2001" to="2001" total="2001" count="1"/>
  <unsorted from="529" to="529" total="529" count="1"/>
</sizes>
<total type="fast" count="0" size="0"/>
<total type="rest" count="6" size="16676"/>
<system type="current" size="135168"/>
<system type="max" size="135168"/>
<aspace type="total" size="135168"/>
<aspace type="mprotect" size="135168"/>
</heap>
<total type="fast" count="0" size="0"/>
<total type="rest" count="6" size="16676"/>
<total type="mmap" count="0" size="0"/>
<system type="current" size="135168"/>
<system type="max" size="135168"/>
<aspace type="total" size="135168"/>
<aspace type="mprotect" size="135168"/>
</malloc>
"#;

    fn collect(report: &str) -> Result<Vec<usize>, IntrospectionError> {
        let mut sizes = Vec::new();
        parse_report(report, &mut |size| sizes.push(size))?;
        Ok(sizes)
    }

    #[test]
    fn report_yields_bins_then_top_chunk() {
        let sizes = collect(REPORT).unwrap();
        // 1553 + 1041 + 1552 = 4146, then 2001, 529, and the top chunk
        assert_eq!(sizes, vec![1553, 1041, 1552, 2001, 529, 10000]);
        assert_eq!(sizes.iter().sum::<usize>(), 16676);
    }

    #[test]
    fn bin_reconstruction_keeps_total_and_bounds() {
        let bin = BinEntry {
            from: 100,
            to: 180,
            total: 1000,
            count: 7,
        };
        bin.validate().unwrap();
        let mut sizes = Vec::new();
        bin.for_each_chunk(&mut |size| sizes.push(size));
        assert_eq!(sizes.len(), 7);
        assert_eq!(sizes.iter().sum::<usize>(), 1000);
        assert_eq!(sizes.iter().max(), Some(&180));
        assert!(sizes.iter().all(|&size| (100..=180).contains(&size)));
    }

    #[test]
    fn fastbin_chunks_are_not_double_counted_in_top() {
        let report = r#"<malloc version="1"><heap nr="0"><sizes>
<size from="17" to="32" total="64" count="2"/>
<size from="600" to="600" total="600" count="1"/>
</sizes>
<total type="fast" count="2" size="64"/>
<total type="rest" count="2" size="1600"/>
</heap></malloc>"#;
        assert_eq!(collect(report).unwrap(), vec![32, 32, 600, 1000]);
    }

    #[test]
    fn every_heap_section_is_read() {
        let report = r#"<malloc version="1">
<heap nr="0"><sizes></sizes><total type="fast" count="0" size="0"/>
<total type="rest" count="1" size="4096"/></heap>
<heap nr="1"><sizes></sizes><total type="fast" count="0" size="0"/>
<total type="rest" count="1" size="512"/></heap>
</malloc>"#;
        assert_eq!(collect(report).unwrap(), vec![4096, 512]);
    }

    #[test]
    fn truncated_report_is_malformed() {
        let truncated = &REPORT[..REPORT.len() / 2];
        assert!(matches!(
            collect(truncated),
            Err(IntrospectionError::Malformed(_))
        ));
    }

    #[test]
    fn report_without_heaps_is_malformed() {
        assert!(collect(r#"<malloc version="1"></malloc>"#).is_err());
    }

    #[test]
    fn non_numeric_attribute_is_malformed() {
        let report = REPORT.replace(r#"total="529""#, r#"total="lots""#);
        assert!(matches!(
            collect(&report),
            Err(IntrospectionError::Malformed("attribute is not a number"))
        ));
    }

    #[test]
    fn inconsistent_bin_is_malformed() {
        let report = REPORT.replace(r#"total="4146""#, r#"total="99999""#);
        assert!(collect(&report).is_err());
    }

    #[test]
    fn attribute_lookup_does_not_match_inside_other_names() {
        let tag = r#"total type="rest" count="3" size="12""#;
        assert_eq!(attribute(tag, "size"), Some("12"));
        assert_eq!(attribute(tag, "type"), Some("rest"));
        assert_eq!(attribute(tag, "ize"), None);
        assert_eq!(tag_name(tag), "total");
        assert_eq!(tag_name("size from=\"1\"/"), "size");
    }
}
