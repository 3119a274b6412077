pub mod blender;
pub mod correlation;
pub mod metrics;
pub mod models;
pub mod returns;
pub mod risk;


pub use blender::{blend, blend_equal, AlignedBook, BlendedSeries};
pub use correlation::{
    correlation_matrix, correlation_matrix_for_series, pairwise, pearson_nonzero,
    CorrelationMatrix, PairCorrelation,
};
pub use metrics::{MetricsEngine, Objective};
pub use models::*;
pub use returns::{daily_returns, ReturnSeries};
pub use risk::{DrawdownPoint, MaxDrawdown};
