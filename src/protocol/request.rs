//! Request descriptors: the view-window parameters a fetch asks for and
//! the JPIP query string handed to the transport.

use std::fmt::Write;

/// Correlates one transport round trip with its bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

/// The region/resolution/quality window a fetch covers.
///
/// `frame_width`/`frame_height` select the resolution (the codestream
/// grid the region coordinates are expressed on, `fsiz`); the region
/// fields map to `roff`/`rsiz`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchWindow {
    pub frame_width: u32,
    pub frame_height: u32,
    pub region_x: u32,
    pub region_y: u32,
    pub region_width: u32,
    pub region_height: u32,
    /// Upper bound on quality layers the server should send.
    pub max_quality_layers: Option<u32>,
}

impl FetchWindow {
    /// A window covering the whole frame.
    pub fn full_frame(width: u32, height: u32) -> Self {
        Self {
            frame_width: width,
            frame_height: height,
            region_x: 0,
            region_y: 0,
            region_width: width,
            region_height: height,
            max_quality_layers: None,
        }
    }
}

/// Whether the server should hold the response until data for the
/// requested quality is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitBehavior {
    NoWait,
    /// Wait until at least this many quality layers can be served.
    WaitForLayers(u32),
}

/// What the transport consumes: a ready-made JPIP query string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestDescriptor {
    pub query: String,
}

pub(crate) struct QueryBuilder {
    query: String,
}

impl QueryBuilder {
    pub fn new() -> Self {
        Self {
            query: String::new(),
        }
    }

    pub fn field(mut self, key: &str, value: impl std::fmt::Display) -> Self {
        if !self.query.is_empty() {
            self.query.push('&');
        }
        // Writing to a String cannot fail.
        let _ = write!(self.query, "{key}={value}");
        self
    }

    pub fn window(mut self, window: &FetchWindow) -> Self {
        self = self
            .field(
                "fsiz",
                format_args!("{},{}", window.frame_width, window.frame_height),
            )
            .field(
                "roff",
                format_args!("{},{}", window.region_x, window.region_y),
            )
            .field(
                "rsiz",
                format_args!("{},{}", window.region_width, window.region_height),
            );
        if let Some(layers) = window.max_quality_layers {
            self = self.field("layers", layers);
        }
        self
    }

    pub fn wait(self, wait: WaitBehavior) -> Self {
        match wait {
            WaitBehavior::NoWait => self.field("wait", "no"),
            WaitBehavior::WaitForLayers(layers) => {
                self.field("wait", "yes").field("layers", layers)
            }
        }
    }

    pub fn build(self) -> RequestDescriptor {
        RequestDescriptor { query: self.query }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_renders_window_fields() {
        let window = FetchWindow {
            frame_width: 4096,
            frame_height: 2048,
            region_x: 128,
            region_y: 64,
            region_width: 512,
            region_height: 256,
            max_quality_layers: Some(3),
        };
        let descriptor = QueryBuilder::new()
            .field("cid", "C7")
            .window(&window)
            .field("qid", 4)
            .build();
        assert_eq!(
            descriptor.query,
            "cid=C7&fsiz=4096,2048&roff=128,64&rsiz=512,256&layers=3&qid=4"
        );
    }

    #[test]
    fn wait_modes() {
        let no_wait = QueryBuilder::new().wait(WaitBehavior::NoWait).build();
        assert_eq!(no_wait.query, "wait=no");
        let wait = QueryBuilder::new()
            .wait(WaitBehavior::WaitForLayers(2))
            .build();
        assert_eq!(wait.query, "wait=yes&layers=2");
    }

    #[test]
    fn full_frame_window_covers_frame() {
        let w = FetchWindow::full_frame(800, 600);
        assert_eq!((w.region_width, w.region_height), (800, 600));
        assert_eq!((w.region_x, w.region_y), (0, 0));
    }
}
