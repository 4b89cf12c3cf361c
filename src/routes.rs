use std::convert::Infallible;

use warp::Filter;

use crate::{CreateRequest, render::Renderer};

fn with_renderer(renderer: Renderer) -> impl Filter<Extract = (Renderer,), Error = Infallible> + Clone {
    warp::any().map(move || renderer.clone())
}

fn json_body() -> impl Filter<Extract = (CreateRequest,), Error = warp::Rejection> + Clone {
    warp::body::content_length_limit(1024 * 16).and(warp::body::json())
}

fn all(renderer: Renderer) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::get()
        .and(warp::path!(".all"))
        .and(with_renderer(renderer))
        .and_then(|renderer: Renderer| async move { renderer.all().await })
}

fn detail(renderer: Renderer) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::get()
        .and(warp::path!(".detail" / String))
        .and(with_renderer(renderer))
        .and_then(|code: String, renderer: Renderer| async move { renderer.detail(&code).await })
}

fn export(renderer: Renderer) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::get()
        .and(warp::path!(".export"))
        .and(with_renderer(renderer))
        .and_then(|renderer: Renderer| async move { renderer.export().await })
}

fn health(renderer: Renderer) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::get()
        .and(warp::path!(".health"))
        .and(with_renderer(renderer))
        .and_then(|renderer: Renderer| async move { renderer.health().await })
}

fn create(renderer: Renderer) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::post()
        .and(warp::path::end())
        .and(json_body())
        .and(with_renderer(renderer))
        .and_then(|request: CreateRequest, renderer: Renderer| async move { renderer.create(request).await })
}

fn get(renderer: Renderer) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::get()
        .and(warp::path::param::<String>())
        .and(warp::path::end())
        .and(warp::header::optional::<String>("referer"))
        .and(warp::header::optional::<String>("x-forwarded-for"))
        .and(with_renderer(renderer))
        .and_then(
            |code: String, referer: Option<String>, forwarded_for: Option<String>, renderer: Renderer| async move {
                renderer
                    .get(&code, referer.as_deref(), forwarded_for.as_deref())
                    .await
            },
        )
}

pub fn get_routes(renderer: Renderer) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    all(renderer.clone())
        .or(detail(renderer.clone()))
        .or(export(renderer.clone()))
        .or(health(renderer.clone()))
        .or(create(renderer.clone()))
        .or(get(renderer))
}
