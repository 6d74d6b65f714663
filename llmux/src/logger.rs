use logforth::append;

use crate::args::Args;

/// Initialize process-wide logging to stderr.
pub fn init(args: &Args) {
    logforth::builder()
        .dispatch(|dispatch| {
            dispatch
                .filter(args.log_level)
                .append(append::Stderr::default())
        })
        .apply();
}
