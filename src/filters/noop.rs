// This file is part of tilepipe released under the MIT license.
// Copyright (c) 2023 TileDB, Inc.

use crate::buffer::FilterBuffer;
use crate::error::Result;
use crate::filters::{
    pass_through, Filter, FilterType, ForwardContext, ReverseContext,
};

/// A filter that does nothing. Both directions produce identity views of
/// their input.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoOpFilter;

impl Filter for NoOpFilter {
    fn filter_type(&self) -> FilterType {
        FilterType::NoOp
    }

    fn clone_dyn(&self) -> Box<dyn Filter> {
        Box::new(*self)
    }

    fn run_forward<'a>(
        &self,
        _ctx: &mut ForwardContext<'_>,
        input_metadata: &mut FilterBuffer<'a>,
        input: &mut FilterBuffer<'a>,
        output_metadata: &mut FilterBuffer<'a>,
        output: &mut FilterBuffer<'a>,
    ) -> Result<()> {
        pass_through(input_metadata, input, output_metadata, output)
    }

    fn run_reverse<'a>(
        &self,
        _ctx: &mut ReverseContext<'_>,
        input_metadata: &mut FilterBuffer<'a>,
        input: &mut FilterBuffer<'a>,
        output_metadata: &mut FilterBuffer<'a>,
        output: &mut FilterBuffer<'a>,
    ) -> Result<()> {
        pass_through(input_metadata, input, output_metadata, output)
    }
}
